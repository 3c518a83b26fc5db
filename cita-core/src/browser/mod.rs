mod automation;
mod error;
mod human;
mod session;

pub use automation::{ChromiumSession, ChromiumSessionFactory};
pub use error::{BrowserError, BrowserResult};
pub use human::HumanPacer;
pub use session::{ElementHandle, OptionChoice, SelectOption, Session, SessionFactory};
