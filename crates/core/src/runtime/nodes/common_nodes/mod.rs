pub(crate) mod catch;
mod complete;
mod debug;
mod inject;
pub(crate) mod link_call;
mod link_in;
mod link_out;
pub(crate) mod status;
mod subflow;
mod test_once;
mod unknown;
