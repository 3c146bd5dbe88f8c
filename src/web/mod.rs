mod handlers;
mod routes;
mod static_files;
mod ws;

pub use routes::create_router;
