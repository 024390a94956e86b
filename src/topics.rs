//! Defines the topic paths that should be used for messages.
//!
//! Allows to address specific threads of specific nodes.

// The topic on which KVS servers are asked to depart by the monitoring system.
const SELF_DEPART_TOPIC: &str = "self_depart";

// The topic on which KVS servers listen for requests for data.
const KEY_REQUEST_TOPIC: &str = "key_request";

// The topic on which KVS servers listen for a replication factor change from
// the monitoring system.
const SERVER_REPLICATION_CHANGE_TOPIC: &str = "server_replication_change";

// The topic on which routing servers listen for replication factor change
// announcements from the monitoring system.
const ROUTING_REPLICATION_CHANGE_TOPIC: &str = "routing_replication_change";

// The topic on which the monitoring node receives join and depart notifications.
const MONITORING_NOTIFY_TOPIC: &str = "monitoring/notify";

// The topic on which benchmark clients report their observed latencies.
const FEEDBACK_REPORT_TOPIC: &str = "monitoring/feedback_report";

const MANAGEMENT_ADD_NODES_TOPIC: &str = "management/add_nodes";
const MANAGEMENT_REMOVE_NODE_TOPIC: &str = "management/remove_node";

/// The network identity of a KVS node.
///
/// Nodes are reachable from outside of the cluster through their public address and from
/// other nodes through their private address.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct NodeAddress {
    /// The public IP address of the node.
    pub public_ip: String,
    /// The cluster-internal IP address of the node.
    pub private_ip: String,
}

impl NodeAddress {
    /// Creates a new address from the given IP pair.
    pub fn new(public_ip: impl Into<String>, private_ip: impl Into<String>) -> Self {
        Self {
            public_ip: public_ip.into(),
            private_ip: private_ip.into(),
        }
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.public_ip, self.private_ip)
    }
}

/// Provides the topic paths for addressing a specific thread of a specific _KVS_ node.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct KvsThread {
    /// The addressed KVS node.
    pub node: NodeAddress,
    /// The ID of the addressed thread on the KVS node.
    pub thread_id: u32,
}

impl KvsThread {
    /// Address the given thread on the given node.
    pub fn new(node: NodeAddress, thread_id: u32) -> Self {
        Self { node, thread_id }
    }

    /// Topic for notifying a node thread that it itself should leave.
    ///
    /// The messages that are sent on this topic are [`SelfDepart`][crate::messages::SelfDepart]
    /// messages.
    pub fn self_depart_topic(&self, prefix: &str) -> String {
        self.topic(prefix, SELF_DEPART_TOPIC)
    }

    /// The topic on which [`Request`][crate::messages::Request] messages are sent.
    pub fn request_topic(&self, prefix: &str) -> String {
        self.topic(prefix, KEY_REQUEST_TOPIC)
    }

    /// Topic for notifying the node thread of replication changes.
    ///
    /// The messages sent on this topic are of type
    /// [`ReplicationFactorUpdate`][crate::messages::replication_factor::ReplicationFactorUpdate].
    pub fn replication_change_topic(&self, prefix: &str) -> String {
        self.topic(prefix, SERVER_REPLICATION_CHANGE_TOPIC)
    }

    fn topic(&self, prefix: &str, kind: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            prefix, self.node.private_ip, kind, self.thread_id
        )
    }
}

/// Addresses the threads of a routing node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RoutingThread {
    /// The ID of the routing node.
    pub node_id: String,
    /// The thread ID on the routing node.
    pub thread_id: u32,
}

impl RoutingThread {
    /// Addresses the given thread on the given routing node.
    pub fn new(node_id: String, thread_id: u32) -> Self {
        Self { node_id, thread_id }
    }

    /// Topic for notifying routing nodes of replication changes.
    ///
    /// The messages sent on this topic are of type
    /// [`ReplicationFactorUpdate`][crate::messages::replication_factor::ReplicationFactorUpdate].
    pub fn replication_change_topic(&self, prefix: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            prefix, self.node_id, ROUTING_REPLICATION_CHANGE_TOPIC, self.thread_id
        )
    }
}

/// Addresses a monitoring node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MonitoringThread {
    /// The ID of the monitoring node.
    pub node_id: String,
}

impl MonitoringThread {
    /// KVS nodes announce joins and departures to the monitoring system on this topic.
    ///
    /// The messages sent on this topic are of type [`Notify`][crate::messages::Notify].
    pub fn notify_topic(prefix: &str) -> String {
        format!("{}/{}", prefix, MONITORING_NOTIFY_TOPIC)
    }

    /// Clients report [`UserFeedback`][crate::messages::user_feedback::UserFeedback] on this
    /// topic.
    pub fn feedback_report_topic(prefix: &str) -> String {
        format!("{}/{}", prefix, FEEDBACK_REPORT_TOPIC)
    }

    /// Responses to the monitoring node's requests and acknowledgements of its replication
    /// updates are sent on this topic.
    pub fn response_topic(&self, prefix: &str) -> String {
        format!("{}/monitoring/{}/response", prefix, self.node_id)
    }

    /// Departing nodes acknowledge each finished thread on this topic.
    ///
    /// The messages sent on this topic are of type [`Departed`][crate::messages::Departed].
    pub fn depart_done_topic(&self, prefix: &str) -> String {
        format!("{}/monitoring/{}/depart_done", prefix, self.node_id)
    }
}

/// Addresses the management node, which provisions and releases machines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManagementThread {
    _private: (),
}

impl ManagementThread {
    /// There is only one management node per cluster.
    pub fn singleton() -> Self {
        Self { _private: () }
    }

    /// Topic for requesting new nodes, see [`AddNodes`][crate::messages::management::AddNodes].
    pub fn add_nodes_topic(&self, prefix: &str) -> String {
        format!("{}/{}", prefix, MANAGEMENT_ADD_NODES_TOPIC)
    }

    /// Topic for releasing departed nodes, see
    /// [`RemoveNode`][crate::messages::management::RemoveNode].
    pub fn remove_node_topic(&self, prefix: &str) -> String {
        format!("{}/{}", prefix, MANAGEMENT_REMOVE_NODE_TOPIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_topics_use_private_address() {
        let thread = KvsThread::new(NodeAddress::new("34.1.2.3", "10.0.0.7"), 2);
        assert_eq!(thread.request_topic("anna"), "anna/10.0.0.7/key_request/2");
        assert_eq!(thread.self_depart_topic("anna"), "anna/10.0.0.7/self_depart/2");
        assert_eq!(
            thread.replication_change_topic("anna"),
            "anna/10.0.0.7/server_replication_change/2"
        );
    }
}
