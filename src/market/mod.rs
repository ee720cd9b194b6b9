pub mod coalescer;
pub mod dispatch;
pub mod pipeline;
pub mod rest;
pub mod table;
pub mod types;
