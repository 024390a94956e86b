use crate::{
    messages::user_feedback::UserFeedback, nodes::monitoring::MonitoringNode,
    transport::Transport,
};
use eyre::Context;

impl<T: Transport> MonitoringNode<T> {
    /// Accumulates client feedback until the next epoch.
    pub fn feedback_handler(&mut self, serialized: &str) -> eyre::Result<()> {
        let fb: UserFeedback =
            serde_json::from_str(serialized).context("failed to deserialize feedback message")?;

        self.feedback
            .record(fb, self.config_data.monitoring.slo_worst_ms);

        Ok(())
    }
}
