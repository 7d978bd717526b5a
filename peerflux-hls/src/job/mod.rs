pub use job::*;

mod job;
