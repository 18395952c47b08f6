pub mod aggregator;
pub mod decoder;
pub mod delta;
pub mod evaluator;
pub mod notification;
pub mod processor;
pub mod scheduler;
pub mod worker_pool;
