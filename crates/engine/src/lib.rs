pub mod backoff;
pub mod realtime;
pub mod stats;
pub mod store;
pub mod tracker;
