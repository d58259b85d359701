pub mod database;
pub mod event_repository;
pub mod models;
pub mod sponsor_repository;
pub mod transfer_repository;

pub use database::Database;
pub use event_repository::EventRepository;
pub use models::{Event, EventState, TokenStandard, Transfer, TransferStatus};
pub use sponsor_repository::SponsorRepository;
pub use transfer_repository::TransferRepository;
