//! Handlers for the messages that the monitoring node receives between epochs.

mod depart_done;
mod feedback;
mod membership;
