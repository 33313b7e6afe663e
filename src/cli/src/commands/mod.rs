pub mod dead_letter;
pub mod queue;
pub mod schedule;
pub mod work;
