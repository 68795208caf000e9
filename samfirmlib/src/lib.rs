pub mod acquire;
pub mod constants;
pub mod crypto;
pub mod decrypt;
pub mod extract;
pub mod fallback;
pub mod fus;
pub mod msg;
pub mod resolve;
pub mod search;
pub mod session;
pub mod version;

#[cfg(test)]
mod testutil;
