//! User lifecycle management and the organization directory.

pub mod directory;
mod manager;


pub use directory::{search_users, DirectoryPage, UserWithStatus};
pub use manager::{NewUser, PrivilegeRequest, UserManager};
