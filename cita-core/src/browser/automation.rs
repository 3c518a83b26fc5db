use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    Headers, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, EventJavascriptDialogOpening,
    HandleJavaScriptDialogParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ChromiumSection;

use super::error::{BrowserError, BrowserResult};
use super::session::{ElementHandle, OptionChoice, SelectOption, Session, SessionFactory};

const WEBDRIVER_MASK: &str =
    "Object.defineProperty(navigator, 'webdriver', { get: () => undefined });";

/// Launches one fresh Chromium per attempt.
#[derive(Debug, Clone)]
pub struct ChromiumSessionFactory {
    config: Arc<ChromiumSection>,
}

impl ChromiumSessionFactory {
    pub fn new(config: ChromiumSection) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    fn build_chromium_config(&self) -> BrowserResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder();
        if let Some(executable) = &self.config.executable_path {
            builder = builder.chrome_executable(executable);
        }
        if let Some(profile) = self.config.profile_dir() {
            builder = builder.user_data_dir(profile);
        }
        if !self.config.headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = self.config.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(timeout));
        }

        let mut args = vec!["--start-maximized".to_string()];
        for feature in &self.config.disable_blink_features {
            args.push(format!("--disable-blink-features={feature}"));
        }
        if let Some(user_agent) = &self.config.user_agent {
            args.push(format!("--user-agent={user_agent}"));
        }
        args.push(format!("--accept-lang={}", self.config.accept_language));
        args.push("--no-first-run".into());
        args.push("--password-store=basic".into());
        builder = builder.args(args);

        builder.build().map_err(BrowserError::Configuration)
    }
}

#[async_trait(?Send)]
impl SessionFactory for ChromiumSessionFactory {
    async fn create(&self) -> BrowserResult<Box<dyn Session>> {
        let chromium_config = self.build_chromium_config()?;
        info!(
            headless = self.config.headless,
            profile = ?self.config.profile_dir(),
            "Launching Chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });

        let page = browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await?;
        let mut session = ChromiumSession {
            browser: Some(browser),
            handler_task: Some(handler_task),
            page,
            elements: HashMap::new(),
            nodes: HashMap::new(),
            next_handle: 1,
        };
        if let Err(err) = session.configure_page(&self.config).await {
            session.close().await.ok();
            return Err(err);
        }
        Ok(Box::new(session))
    }
}

pub struct ChromiumSession {
    browser: Option<Browser>,
    handler_task: Option<JoinHandle<()>>,
    page: Page,
    elements: HashMap<u64, Element>,
    /// Backend node id to the handle already issued for that node.
    nodes: HashMap<i64, u64>,
    next_handle: u64,
}

impl ChromiumSession {
    async fn configure_page(&mut self, config: &ChromiumSection) -> BrowserResult<()> {
        let user_agent = match &config.user_agent {
            Some(agent) => agent.clone(),
            None => match &self.browser {
                Some(browser) => browser.user_agent().await?,
                None => return Err(BrowserError::Released),
            },
        };
        self.page.enable_stealth_mode_with_agent(&user_agent).await?;

        let params = SetUserAgentOverrideParams::builder()
            .user_agent(user_agent)
            .accept_language(config.accept_language.clone())
            .platform("MacIntel")
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page.set_user_agent(params).await?;

        let headers = Headers::new(serde_json::json!({
            "Accept-Language": config.accept_language,
        }));
        self.page
            .execute(SetExtraHttpHeadersParams::new(headers))
            .await?;

        self.page
            .evaluate_on_new_document(
                AddScriptToEvaluateOnNewDocumentParams::builder()
                    .source(WEBDRIVER_MASK)
                    .build()
                    .map_err(BrowserError::Configuration)?,
            )
            .await?;
        Ok(())
    }

    /// Issues a handle for `element`, reusing the one already held for the
    /// same DOM node so repeated polling does not grow the table.
    fn register(&mut self, element: Element) -> ElementHandle {
        let node = *element.backend_node_id.inner();
        let id = match self.nodes.get(&node) {
            Some(id) => *id,
            None => {
                let id = self.next_handle;
                self.next_handle += 1;
                self.nodes.insert(node, id);
                id
            }
        };
        self.elements.insert(id, element);
        ElementHandle::new(id)
    }

    fn forget_elements(&mut self) {
        self.elements.clear();
        self.nodes.clear();
    }

    fn element(&self, handle: ElementHandle) -> BrowserResult<&Element> {
        self.elements
            .get(&handle.id())
            .ok_or(BrowserError::StaleHandle(handle.id()))
    }

    async fn call_json(&self, handle: ElementHandle, function: &str) -> BrowserResult<Value> {
        let wrapped = format!(
            "function() {{ const result = ({function}).apply(this); \
             return JSON.stringify(result === undefined ? null : result); }}"
        );
        let returns = self.element(handle)?.call_js_fn(wrapped, false).await?;
        decode_json_string(returns.result.value)
    }
}

async fn evaluate(page: &Page, code: &str) -> BrowserResult<Value> {
    let params = EvaluateParams::builder()
        .expression(code)
        .return_by_value(true)
        .await_promise(true)
        .build()
        .map_err(BrowserError::Configuration)?;
    let result = page.evaluate_expression(params).await?;
    Ok(result.value().cloned().unwrap_or(Value::Null))
}

fn decode_json_string(value: Option<Value>) -> BrowserResult<Value> {
    match value {
        Some(Value::String(raw)) => serde_json::from_str(&raw)
            .map_err(|err| BrowserError::Script(format!("invalid JSON from page: {err}"))),
        Some(other) => Ok(other),
        None => Ok(Value::Null),
    }
}

fn select_script(choice: &OptionChoice) -> String {
    let (mode, argument) = match choice {
        OptionChoice::VisibleText(text) => ("text", Value::String(text.clone())),
        OptionChoice::Value(value) => ("value", Value::String(value.clone())),
        OptionChoice::Last => ("last", Value::Null),
    };
    format!(
        r#"function() {{
    const mode = "{mode}";
    const argument = {argument};
    const options = Array.from(this.options);
    let index = -1;
    if (mode === "text") index = options.findIndex(o => o.text.trim() === argument);
    if (mode === "value") index = options.findIndex(o => o.value === argument);
    if (mode === "last") index = options.length - 1;
    if (index < 0) return null;
    this.selectedIndex = index;
    this.dispatchEvent(new Event('change', {{ bubbles: true }}));
    return {{ value: options[index].value, text: options[index].text }};
}}"#
    )
}

#[async_trait(?Send)]
impl Session for ChromiumSession {
    async fn navigate(&mut self, url: &str) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.forget_elements();
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn find_element(&mut self, selector: &str) -> BrowserResult<Option<ElementHandle>> {
        let mut found = self.page.find_elements(selector).await?;
        if found.is_empty() {
            return Ok(None);
        }
        let element = found.swap_remove(0);
        Ok(Some(self.register(element)))
    }

    async fn find_elements(&mut self, selector: &str) -> BrowserResult<Vec<ElementHandle>> {
        let found = self.page.find_elements(selector).await?;
        Ok(found
            .into_iter()
            .map(|element| self.register(element))
            .collect())
    }

    async fn click(&mut self, handle: ElementHandle) -> BrowserResult<()> {
        self.element(handle)?.click().await?;
        Ok(())
    }

    async fn type_text(&mut self, handle: ElementHandle, text: &str) -> BrowserResult<()> {
        let element = self.element(handle)?;
        element.focus().await?;
        element.type_str(text).await?;
        Ok(())
    }

    async fn clear_text(&mut self, handle: ElementHandle) -> BrowserResult<()> {
        self.call_json(
            handle,
            "function() { this.value = ''; this.dispatchEvent(new Event('input', { bubbles: true })); }",
        )
        .await?;
        Ok(())
    }

    async fn options(&mut self, handle: ElementHandle) -> BrowserResult<Vec<SelectOption>> {
        let value = self
            .call_json(
                handle,
                "function() { return Array.from(this.options || []).map(o => ({ value: o.value, text: o.text })); }",
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|err| BrowserError::Script(format!("failed to decode select options: {err}")))
    }

    async fn select_option(
        &mut self,
        handle: ElementHandle,
        choice: &OptionChoice,
    ) -> BrowserResult<Option<SelectOption>> {
        let value = self.call_json(handle, &select_script(choice)).await?;
        serde_json::from_value(value)
            .map_err(|err| BrowserError::Script(format!("failed to decode selection: {err}")))
    }

    async fn scroll_into_view(&mut self, handle: ElementHandle) -> BrowserResult<()> {
        self.call_json(
            handle,
            "function() { this.scrollIntoView({ block: 'center' }); }",
        )
        .await?;
        Ok(())
    }

    async fn attribute(
        &mut self,
        handle: ElementHandle,
        name: &str,
    ) -> BrowserResult<Option<String>> {
        Ok(self.element(handle)?.attribute(name).await?)
    }

    async fn call_on(&mut self, handle: ElementHandle, function: &str) -> BrowserResult<Value> {
        self.call_json(handle, function).await
    }

    async fn evaluate_script(&mut self, code: &str) -> BrowserResult<Value> {
        evaluate(&self.page, code).await
    }

    async fn evaluate_accepting_dialogs(&mut self, code: &str) -> BrowserResult<bool> {
        // Runtime.evaluate does not answer while a dialog is open, so the
        // dialog has to be handled from the event stream.
        let mut dialogs = self
            .page
            .event_listener::<EventJavascriptDialogOpening>()
            .await?;
        let page = self.page.clone();
        let evaluation = evaluate(&page, code);
        tokio::pin!(evaluation);

        let mut accepted = false;
        loop {
            tokio::select! {
                result = &mut evaluation => {
                    result?;
                    return Ok(accepted);
                }
                Some(dialog) = dialogs.next() => {
                    debug!(kind = ?dialog.r#type, message = %dialog.message, "Accepting page dialog");
                    self.page
                        .execute(HandleJavaScriptDialogParams::new(true))
                        .await?;
                    accepted = true;
                }
            }
        }
    }

    async fn current_location(&mut self) -> BrowserResult<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn title(&mut self) -> BrowserResult<String> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    async fn content_snapshot(&mut self) -> BrowserResult<String> {
        Ok(self.page.content().await?)
    }

    async fn body_text(&mut self) -> BrowserResult<String> {
        let value = self
            .evaluate_script("document.body ? document.body.innerText : ''")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn handle_still_valid(&mut self, handle: ElementHandle) -> BrowserResult<bool> {
        let Some(element) = self.elements.get(&handle.id()) else {
            return Ok(false);
        };
        match element
            .call_js_fn("function() { return this.isConnected; }", false)
            .await
        {
            Ok(returns) => Ok(returns
                .result
                .value
                .and_then(|value| value.as_bool())
                .unwrap_or(false)),
            // The remote object died with its execution context.
            Err(CdpError::Chrome(_)) | Err(CdpError::JavascriptException(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn dom_size(&mut self) -> BrowserResult<i64> {
        let value = self
            .evaluate_script("document.documentElement.outerHTML.length")
            .await?;
        value
            .as_i64()
            .ok_or_else(|| BrowserError::Script(format!("dom size was not a number: {value}")))
    }

    async fn close(&mut self) -> BrowserResult<()> {
        self.forget_elements();
        let Some(mut browser) = self.browser.take() else {
            return Ok(());
        };
        info!("Shutting down Chromium instance");
        if let Err(err) = browser.close().await {
            warn!(error = %err, "Failed to close browser gracefully");
        }
        if let Err(err) = browser.wait().await {
            warn!(error = %err, "Failed to reap browser process");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Browser handler join error");
            }
        }
        Ok(())
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        if self.browser.is_some() {
            warn!("ChromiumSession dropped without explicit close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chromium_config_builds_from_defaults() {
        let mut section = ChromiumSection::default();
        section.executable_path = Some("/usr/bin/chromium".into());
        section.user_data_dir = Some("/tmp/cita-profile".into());
        let factory = ChromiumSessionFactory::new(section);
        assert!(factory.build_chromium_config().is_ok());
    }

    #[test]
    fn select_script_embeds_choice() {
        let script = select_script(&OptionChoice::VisibleText("Barcelona".into()));
        assert!(script.contains(r#"const mode = "text";"#));
        assert!(script.contains(r#"const argument = "Barcelona";"#));
        let script = select_script(&OptionChoice::Last);
        assert!(script.contains(r#"const mode = "last";"#));
        assert!(script.contains("const argument = null;"));
    }

    #[test]
    fn json_strings_from_page_are_decoded() {
        let value = decode_json_string(Some(Value::String(r#"{"value":"1"}"#.into()))).unwrap();
        assert_eq!(value["value"], "1");
        assert_eq!(decode_json_string(None).unwrap(), Value::Null);
    }
}
