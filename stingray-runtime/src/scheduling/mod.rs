mod routine;
mod routine_queue;
mod timekeeper;
mod worker;

pub mod task_pool;

pub use task_pool::TaskPool;
