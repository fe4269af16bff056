pub mod batch_file;
pub mod http_batch;

pub use batch_file::BatchFileSource;
pub use http_batch::HttpBatchSource;
