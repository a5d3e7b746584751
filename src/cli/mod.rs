pub mod cost;
pub mod hoistable;
pub mod optimize;
