pub mod flow;
pub mod scheduled;
pub mod suppression;
pub mod template;
