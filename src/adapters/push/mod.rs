pub mod apns;

pub use apns::ApnsTransport;
