pub mod analysis;
pub mod images;
pub mod prompts;
pub mod queue;
pub mod worker;
