mod worker;

pub use worker::Dispatcher;
