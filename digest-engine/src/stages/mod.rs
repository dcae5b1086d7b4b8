pub mod assemble;
pub mod deliver;
pub mod fetch;
pub mod summarize;
