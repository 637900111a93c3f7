pub mod auth;
pub mod comments;
pub mod posts;
pub mod reactions;
pub mod threads;

pub use auth::auth_routes;
pub use comments::comments_routes;
pub use posts::posts_routes;
pub use reactions::reactions_routes;
pub use threads::threads_routes;
