mod ads;
pub mod stream;

pub use ads::run_aggregated_stream;
pub use stream::{run_resource_stream, ResponseSender};
