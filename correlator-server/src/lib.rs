pub mod notify;
pub mod routes;
pub mod source;
