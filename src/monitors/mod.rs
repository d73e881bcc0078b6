pub mod system;

pub use system::collect_metrics;
