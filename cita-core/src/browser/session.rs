use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::BrowserResult;

/// Opaque reference to an element resolved inside one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementHandle(u64);

impl ElementHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "element#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionChoice {
    VisibleText(String),
    Value(String),
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub value: String,
    pub text: String,
}

/// Capability surface of one remote interactive session.
///
/// Every method fails only for transport faults. "Not there" answers are
/// ordinary values (`None`, empty vectors, `false`).
#[async_trait(?Send)]
pub trait Session {
    async fn navigate(&mut self, url: &str) -> BrowserResult<()>;
    async fn find_element(&mut self, selector: &str) -> BrowserResult<Option<ElementHandle>>;
    async fn find_elements(&mut self, selector: &str) -> BrowserResult<Vec<ElementHandle>>;
    async fn click(&mut self, handle: ElementHandle) -> BrowserResult<()>;
    async fn type_text(&mut self, handle: ElementHandle, text: &str) -> BrowserResult<()>;
    async fn clear_text(&mut self, handle: ElementHandle) -> BrowserResult<()>;
    async fn options(&mut self, handle: ElementHandle) -> BrowserResult<Vec<SelectOption>>;
    /// Returns the option that ended up selected, `None` when nothing matched.
    async fn select_option(
        &mut self,
        handle: ElementHandle,
        choice: &OptionChoice,
    ) -> BrowserResult<Option<SelectOption>>;
    async fn scroll_into_view(&mut self, handle: ElementHandle) -> BrowserResult<()>;
    async fn attribute(&mut self, handle: ElementHandle, name: &str)
        -> BrowserResult<Option<String>>;
    /// Runs `function` with `this` bound to the element and returns its JSON result.
    async fn call_on(&mut self, handle: ElementHandle, function: &str) -> BrowserResult<Value>;
    async fn evaluate_script(&mut self, code: &str) -> BrowserResult<Value>;
    async fn current_location(&mut self) -> BrowserResult<String>;
    async fn title(&mut self) -> BrowserResult<String>;
    async fn content_snapshot(&mut self) -> BrowserResult<String>;
    async fn body_text(&mut self) -> BrowserResult<String>;
    async fn handle_still_valid(&mut self, handle: ElementHandle) -> BrowserResult<bool>;
    async fn dom_size(&mut self) -> BrowserResult<i64>;
    /// Evaluates `code`, accepting every JavaScript dialog it opens while it
    /// runs. Returns whether a dialog was accepted.
    async fn evaluate_accepting_dialogs(&mut self, code: &str) -> BrowserResult<bool>;
    /// Releases the underlying resource. Idempotent.
    async fn close(&mut self) -> BrowserResult<()>;
}

#[async_trait(?Send)]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> BrowserResult<Box<dyn Session>>;
}
