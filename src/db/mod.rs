pub mod models;
pub mod queries;
pub mod writer;

pub use writer::ResultWriter;
