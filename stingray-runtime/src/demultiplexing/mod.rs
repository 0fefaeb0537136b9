pub mod epoll_set;

pub use epoll_set::{EpollSet, EventDispatch};
