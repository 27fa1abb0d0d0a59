mod common;
mod end_to_end;
mod forward_proxy;
mod remote_coordination;
