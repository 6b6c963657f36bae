pub mod artifact;
pub mod label;
pub mod record;
pub mod task;
