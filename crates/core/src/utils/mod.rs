pub mod async_util;
pub mod time;
pub mod topo;
