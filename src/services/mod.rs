pub mod blobstore;
pub mod inference;
pub mod notifier;
pub mod queue;
pub mod similarity;
