pub mod compose;
pub mod extract;
pub mod middleware;
pub mod routes;
pub mod state;
