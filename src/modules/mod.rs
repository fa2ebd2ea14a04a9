pub mod crypt;
pub mod logger;
pub mod sessions;
