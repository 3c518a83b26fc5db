//! Scripted doubles for the session, captcha, notification and operator
//! capabilities. Timing follows the tokio clock, so tests running with
//! `start_paused = true` advance scripted page changes deterministically.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::browser::{
    BrowserError, BrowserResult, ElementHandle, OptionChoice, SelectOption, Session,
    SessionFactory,
};
use crate::captcha::{CaptchaError, CaptchaSolver, ScoredChallenge};
use crate::config::CitaConfig;
use crate::notify::{Notifier, Operator};
use crate::workflow::slot_cells_selector;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One selector's worth of elements on a scripted page.
#[derive(Debug, Clone, Default)]
pub struct ElementFixture {
    pub count: usize,
    pub options: Vec<SelectOption>,
    pub attributes: HashMap<String, String>,
    pub checked: bool,
    pub value: String,
}

impl ElementFixture {
    pub fn single() -> Self {
        Self::repeated(1)
    }

    pub fn repeated(count: usize) -> Self {
        Self {
            count,
            ..Self::default()
        }
    }

    pub fn with_options<I, V, T>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = (V, T)>,
        V: Into<String>,
        T: Into<String>,
    {
        self.options = options
            .into_iter()
            .map(|(value, text)| SelectOption {
                value: value.into(),
                text: text.into(),
            })
            .collect();
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn checked(mut self, checked: bool) -> Self {
        self.checked = checked;
        self
    }
}

#[derive(Debug, Clone)]
pub enum Trigger {
    Click(String),
    /// Fires when an evaluated script contains the fragment.
    Script(String),
    /// Fires when a navigated url contains the fragment.
    Navigate(String),
}

#[derive(Debug, Clone)]
struct Reaction {
    trigger: Trigger,
    after: Duration,
    change: PageChange,
}

/// Remote page state: location, markup, elements and the reactions that
/// interactions on this page trigger.
#[derive(Debug, Clone)]
pub struct PageFixture {
    pub location: String,
    pub title: String,
    pub content: String,
    pub dom_size: i64,
    pub elements: BTreeMap<String, ElementFixture>,
    reactions: Vec<Reaction>,
}

impl PageFixture {
    pub fn at(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            title: String::new(),
            content: "<html><body></body></html>".to_string(),
            dom_size: 1_000,
            elements: BTreeMap::new(),
            reactions: Vec::new(),
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_dom_size(mut self, dom_size: i64) -> Self {
        self.dom_size = dom_size;
        self
    }

    pub fn with_element(self, selector: impl Into<String>) -> Self {
        self.with_fixture(selector, ElementFixture::single())
    }

    pub fn with_fixture(mut self, selector: impl Into<String>, fixture: ElementFixture) -> Self {
        self.elements.insert(selector.into(), fixture);
        self
    }

    pub fn with_select<I, V, T>(self, selector: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = (V, T)>,
        V: Into<String>,
        T: Into<String>,
    {
        self.with_fixture(selector, ElementFixture::single().with_options(options))
    }

    /// Adds the attribute, creating a single element when the selector is new.
    pub fn with_attribute(
        mut self,
        selector: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let element = self
            .elements
            .entry(selector.into())
            .or_insert_with(ElementFixture::single);
        element.attributes.insert(name.into(), value.into());
        self
    }

    pub fn on(mut self, trigger: Trigger, after: Duration, change: PageChange) -> Self {
        self.reactions.push(Reaction {
            trigger,
            after,
            change,
        });
        self
    }

    pub fn on_click(self, selector: impl Into<String>, after: Duration, next: PageFixture) -> Self {
        self.on(Trigger::Click(selector.into()), after, PageChange::Replace(next))
    }

    pub fn on_script(self, fragment: impl Into<String>, after: Duration, next: PageFixture) -> Self {
        self.on(Trigger::Script(fragment.into()), after, PageChange::Replace(next))
    }

    /// The matching script raises a confirm dialog; `next` loads once it is accepted.
    pub fn on_script_confirm(self, fragment: impl Into<String>, next: PageFixture) -> Self {
        self.on(
            Trigger::Script(fragment.into()),
            Duration::ZERO,
            PageChange::Dialog(Box::new(next)),
        )
    }

    pub fn on_navigate(self, fragment: impl Into<String>, next: PageFixture) -> Self {
        self.on(
            Trigger::Navigate(fragment.into()),
            Duration::ZERO,
            PageChange::Replace(next),
        )
    }
}

#[derive(Debug, Clone)]
pub enum PageChange {
    /// Swaps in a new document; every previously issued handle goes stale.
    Replace(PageFixture),
    SetLocation(String),
    SetDomSize(i64),
    Remove(String),
    /// Opens a JavaScript dialog. Script evaluation stalls until it is
    /// accepted, which then loads the boxed page.
    Dialog(Box<PageFixture>),
}

/// How long a plain script evaluation waits on an open dialog before the
/// transport gives up, mirroring the CDP request timeout.
pub const DIALOG_STALL: Duration = Duration::from_secs(30);

/// Everything a scripted session was asked to do.
#[derive(Debug, Clone, Default)]
pub struct SessionProbe {
    pub navigations: Vec<String>,
    pub clicks: Vec<String>,
    pub typed: Vec<(String, String)>,
    pub selected: Vec<(String, SelectOption)>,
    pub scripts: Vec<String>,
    pub dialogs_accepted: u32,
    pub close_calls: u32,
}

impl SessionProbe {
    pub fn closed(&self) -> bool {
        self.close_calls > 0
    }

    /// Last text typed into `selector`.
    pub fn typed_into(&self, selector: &str) -> Option<&str> {
        self.typed
            .iter()
            .rev()
            .find(|(target, _)| target == selector)
            .map(|(_, text)| text.as_str())
    }

    pub fn selected_in(&self, selector: &str) -> Option<&SelectOption> {
        self.selected
            .iter()
            .rev()
            .find(|(target, _)| target == selector)
            .map(|(_, option)| option)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProbeHandle(Arc<Mutex<SessionProbe>>);

impl ProbeHandle {
    pub fn snapshot(&self) -> SessionProbe {
        lock(&self.0).clone()
    }

    fn record(&self, update: impl FnOnce(&mut SessionProbe)) {
        update(&mut lock(&self.0));
    }
}

#[derive(Debug, Clone)]
struct HandleEntry {
    selector: String,
    index: usize,
    generation: u64,
}

/// In-memory [`Session`] whose page changes on clicks, scripts, navigation
/// and scheduled timers.
#[derive(Debug)]
pub struct ScriptedSession {
    page: PageFixture,
    generation: u64,
    handles: HashMap<u64, HandleEntry>,
    next_handle: u64,
    pending: Vec<(Instant, PageChange)>,
    dialog: Option<Box<PageFixture>>,
    location_faults: u32,
    dom_size_faults: u32,
    probe: ProbeHandle,
}

impl ScriptedSession {
    pub fn new(page: PageFixture) -> Self {
        Self {
            page,
            generation: 0,
            handles: HashMap::new(),
            next_handle: 1,
            pending: Vec::new(),
            dialog: None,
            location_faults: 0,
            dom_size_faults: 0,
            probe: ProbeHandle::default(),
        }
    }

    pub fn probe(&self) -> ProbeHandle {
        self.probe.clone()
    }

    pub fn schedule(&mut self, after: Duration, change: PageChange) {
        self.pending.push((Instant::now() + after, change));
    }

    pub fn fail_location_times(&mut self, times: u32) {
        self.location_faults = times;
    }

    pub fn fail_dom_size_times(&mut self, times: u32) {
        self.dom_size_faults = times;
    }

    fn apply_due(&mut self) {
        let now = Instant::now();
        self.pending.sort_by_key(|(due, _)| *due);
        let ready = self.pending.iter().take_while(|(due, _)| *due <= now).count();
        let changes: Vec<PageChange> = self.pending.drain(..ready).map(|(_, change)| change).collect();
        for change in changes {
            self.apply(change);
        }
    }

    fn apply(&mut self, change: PageChange) {
        match change {
            PageChange::Replace(page) => {
                self.page = page;
                self.generation += 1;
            }
            PageChange::SetLocation(location) => self.page.location = location,
            PageChange::SetDomSize(size) => self.page.dom_size = size,
            PageChange::Remove(selector) => {
                self.page.elements.remove(&selector);
            }
            PageChange::Dialog(next) => self.dialog = Some(next),
        }
    }

    /// Runs `code` against the page; `true` when a dialog is open afterwards.
    fn run_script(&mut self, code: &str) -> bool {
        self.apply_due();
        self.probe.record(|probe| probe.scripts.push(code.to_string()));
        if self.dialog.is_none() {
            self.fire(|trigger| matches!(trigger, Trigger::Script(fragment) if code.contains(fragment.as_str())));
        }
        self.dialog.is_some()
    }

    fn accept_open_dialog(&mut self) {
        if let Some(next) = self.dialog.take() {
            self.probe.record(|probe| probe.dialogs_accepted += 1);
            self.apply(PageChange::Replace(*next));
        }
    }

    fn fire(&mut self, matches: impl Fn(&Trigger) -> bool) {
        let now = Instant::now();
        let due: Vec<(Instant, PageChange)> = self
            .page
            .reactions
            .iter()
            .filter(|reaction| matches(&reaction.trigger))
            .map(|reaction| (now + reaction.after, reaction.change.clone()))
            .collect();
        self.pending.extend(due);
        self.apply_due();
    }

    fn issue(&mut self, selector: &str, index: usize) -> ElementHandle {
        let id = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(
            id,
            HandleEntry {
                selector: selector.to_string(),
                index,
                generation: self.generation,
            },
        );
        ElementHandle::new(id)
    }

    fn is_live(&self, entry: &HandleEntry) -> bool {
        entry.generation == self.generation
            && self
                .page
                .elements
                .get(&entry.selector)
                .map_or(false, |element| entry.index < element.count)
    }

    fn resolve(&mut self, handle: ElementHandle) -> BrowserResult<(String, &mut ElementFixture)> {
        self.apply_due();
        let entry = self
            .handles
            .get(&handle.id())
            .filter(|entry| self.is_live(entry))
            .cloned()
            .ok_or(BrowserError::StaleHandle(handle.id()))?;
        let element = self
            .page
            .elements
            .get_mut(&entry.selector)
            .ok_or(BrowserError::StaleHandle(handle.id()))?;
        Ok((entry.selector, element))
    }

    fn take_fault(counter: &mut u32, what: &str) -> BrowserResult<()> {
        if *counter > 0 {
            *counter = counter.saturating_sub(1);
            return Err(BrowserError::Unexpected(format!("scripted {what} fault")));
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl Session for ScriptedSession {
    async fn navigate(&mut self, url: &str) -> BrowserResult<()> {
        self.apply_due();
        self.probe.record(|probe| probe.navigations.push(url.to_string()));
        self.page.location = url.to_string();
        self.generation += 1;
        self.fire(|trigger| matches!(trigger, Trigger::Navigate(fragment) if url.contains(fragment.as_str())));
        Ok(())
    }

    async fn find_element(&mut self, selector: &str) -> BrowserResult<Option<ElementHandle>> {
        self.apply_due();
        let present = self
            .page
            .elements
            .get(selector)
            .map_or(false, |element| element.count > 0);
        Ok(present.then(|| self.issue(selector, 0)))
    }

    async fn find_elements(&mut self, selector: &str) -> BrowserResult<Vec<ElementHandle>> {
        self.apply_due();
        let count = self.page.elements.get(selector).map_or(0, |element| element.count);
        Ok((0..count).map(|index| self.issue(selector, index)).collect())
    }

    async fn click(&mut self, handle: ElementHandle) -> BrowserResult<()> {
        let (selector, element) = self.resolve(handle)?;
        element.checked = !element.checked;
        self.probe.record(|probe| probe.clicks.push(selector.clone()));
        self.fire(|trigger| matches!(trigger, Trigger::Click(target) if *target == selector));
        Ok(())
    }

    async fn type_text(&mut self, handle: ElementHandle, text: &str) -> BrowserResult<()> {
        let (selector, element) = self.resolve(handle)?;
        element.value.push_str(text);
        self.probe
            .record(|probe| probe.typed.push((selector, text.to_string())));
        Ok(())
    }

    async fn clear_text(&mut self, handle: ElementHandle) -> BrowserResult<()> {
        let (_, element) = self.resolve(handle)?;
        element.value.clear();
        Ok(())
    }

    async fn options(&mut self, handle: ElementHandle) -> BrowserResult<Vec<SelectOption>> {
        let (_, element) = self.resolve(handle)?;
        Ok(element.options.clone())
    }

    async fn select_option(
        &mut self,
        handle: ElementHandle,
        choice: &OptionChoice,
    ) -> BrowserResult<Option<SelectOption>> {
        let (selector, element) = self.resolve(handle)?;
        let options = &element.options;
        let picked = match choice {
            OptionChoice::VisibleText(text) => {
                options.iter().find(|option| option.text.trim() == text.trim())
            }
            OptionChoice::Value(value) => options.iter().find(|option| option.value == *value),
            OptionChoice::Last => options.last(),
        }
        .cloned();
        if let Some(option) = &picked {
            element.value = option.value.clone();
            let option = option.clone();
            self.probe.record(|probe| probe.selected.push((selector, option)));
        }
        Ok(picked)
    }

    async fn scroll_into_view(&mut self, handle: ElementHandle) -> BrowserResult<()> {
        self.resolve(handle).map(|_| ())
    }

    async fn attribute(
        &mut self,
        handle: ElementHandle,
        name: &str,
    ) -> BrowserResult<Option<String>> {
        let (_, element) = self.resolve(handle)?;
        let value = element.attributes.get(name).cloned();
        if value.is_none() && name == "value" && !element.value.is_empty() {
            return Ok(Some(element.value.clone()));
        }
        Ok(value)
    }

    async fn call_on(&mut self, handle: ElementHandle, function: &str) -> BrowserResult<Value> {
        let (_, element) = self.resolve(handle)?;
        let checked = element.checked;
        self.probe.record(|probe| probe.scripts.push(function.to_string()));
        if function.contains("this.checked") {
            return Ok(Value::Bool(checked));
        }
        Ok(Value::Null)
    }

    async fn evaluate_script(&mut self, code: &str) -> BrowserResult<Value> {
        if code.contains("document.readyState") && self.dialog.is_none() {
            self.apply_due();
            return Ok(Value::String("complete".to_string()));
        }
        if self.run_script(code) {
            tokio::time::sleep(DIALOG_STALL).await;
            return Err(BrowserError::Unexpected(
                "script evaluation timed out behind an open dialog".to_string(),
            ));
        }
        Ok(Value::Null)
    }

    async fn evaluate_accepting_dialogs(&mut self, code: &str) -> BrowserResult<bool> {
        if !self.run_script(code) {
            return Ok(false);
        }
        self.accept_open_dialog();
        self.apply_due();
        Ok(true)
    }

    async fn current_location(&mut self) -> BrowserResult<String> {
        Self::take_fault(&mut self.location_faults, "location")?;
        self.apply_due();
        Ok(self.page.location.clone())
    }

    async fn title(&mut self) -> BrowserResult<String> {
        self.apply_due();
        Ok(self.page.title.clone())
    }

    async fn content_snapshot(&mut self) -> BrowserResult<String> {
        self.apply_due();
        Ok(self.page.content.clone())
    }

    async fn body_text(&mut self) -> BrowserResult<String> {
        self.apply_due();
        Ok(self.page.content.clone())
    }

    async fn handle_still_valid(&mut self, handle: ElementHandle) -> BrowserResult<bool> {
        self.apply_due();
        Ok(self
            .handles
            .get(&handle.id())
            .map_or(false, |entry| self.is_live(entry)))
    }

    async fn dom_size(&mut self) -> BrowserResult<i64> {
        Self::take_fault(&mut self.dom_size_faults, "dom size")?;
        self.apply_due();
        Ok(self.page.dom_size)
    }

    async fn close(&mut self) -> BrowserResult<()> {
        self.probe.record(|probe| probe.close_calls += 1);
        Ok(())
    }
}

type SessionBuilder = Box<dyn Fn() -> ScriptedSession + Send + Sync>;

/// Hands out queued scripted sessions, then falls back to a builder.
#[derive(Default)]
pub struct ScriptedSessionFactory {
    queue: Mutex<VecDeque<ScriptedSession>>,
    fallback: Option<SessionBuilder>,
    launch_faults: Mutex<u32>,
    probes: Mutex<Vec<ProbeHandle>>,
}

impl ScriptedSessionFactory {
    pub fn new(sessions: impl IntoIterator<Item = ScriptedSession>) -> Self {
        Self {
            queue: Mutex::new(sessions.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn repeating(builder: impl Fn() -> ScriptedSession + Send + Sync + 'static) -> Self {
        Self {
            fallback: Some(Box::new(builder)),
            ..Self::default()
        }
    }

    pub fn then_repeating(
        mut self,
        builder: impl Fn() -> ScriptedSession + Send + Sync + 'static,
    ) -> Self {
        self.fallback = Some(Box::new(builder));
        self
    }

    pub fn failing_first(self, launches: u32) -> Self {
        *lock(&self.launch_faults) = launches;
        self
    }

    pub fn created(&self) -> usize {
        lock(&self.probes).len()
    }

    pub fn probes(&self) -> Vec<SessionProbe> {
        lock(&self.probes).iter().map(ProbeHandle::snapshot).collect()
    }
}

#[async_trait(?Send)]
impl SessionFactory for ScriptedSessionFactory {
    async fn create(&self) -> BrowserResult<Box<dyn Session>> {
        {
            let mut faults = lock(&self.launch_faults);
            if *faults > 0 {
                *faults -= 1;
                return Err(BrowserError::Launch("scripted launch fault".to_string()));
            }
        }
        let queued = lock(&self.queue).pop_front();
        let session = match (queued, &self.fallback) {
            (Some(session), _) => session,
            (None, Some(builder)) => builder(),
            (None, None) => {
                return Err(BrowserError::Launch("no scripted sessions left".to_string()))
            }
        };
        lock(&self.probes).push(session.probe());
        Ok(Box::new(session))
    }
}

/// Records every emitted notification.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    messages: Arc<Mutex<Vec<(String, u64)>>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(String, u64)> {
        lock(&self.messages).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn emit(&self, message: &str, seconds: u64) {
        lock(&self.messages).push((message.to_string(), seconds));
    }
}

/// Answers prompts from a queue; ENTER prompts always succeed.
#[derive(Debug, Clone, Default)]
pub struct RecordingOperator {
    answers: Arc<Mutex<VecDeque<String>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl RecordingOperator {
    pub fn answering(answers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            answers: Arc::new(Mutex::new(answers.into_iter().map(Into::into).collect())),
            prompts: Arc::default(),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl Operator for RecordingOperator {
    async fn wait_for_enter(&self, prompt: &str) -> io::Result<()> {
        lock(&self.prompts).push(prompt.to_string());
        Ok(())
    }

    async fn read_line(&self, prompt: &str) -> io::Result<String> {
        lock(&self.prompts).push(prompt.to_string());
        lock(&self.answers).pop_front().ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted operator answer")
        })
    }
}

/// Solver that returns a fixed answer for both challenge kinds, or always fails.
#[derive(Debug, Clone)]
pub struct FixedSolver {
    answer: Option<String>,
    calls: Arc<Mutex<u32>>,
}

impl FixedSolver {
    pub fn answering(answer: impl Into<String>) -> Self {
        Self {
            answer: Some(answer.into()),
            calls: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: None,
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> u32 {
        *lock(&self.calls)
    }

    fn respond(&self) -> Result<String, CaptchaError> {
        *lock(&self.calls) += 1;
        self.answer.clone().ok_or_else(|| CaptchaError::Service {
            code: "ERROR_CAPTCHA_UNSOLVABLE".to_string(),
            description: "scripted failure".to_string(),
        })
    }
}

#[async_trait]
impl CaptchaSolver for FixedSolver {
    async fn solve_scored(&self, _challenge: &ScoredChallenge) -> Result<String, CaptchaError> {
        self.respond()
    }

    async fn solve_image(&self, _image: &[u8]) -> Result<String, CaptchaError> {
        self.respond()
    }
}

pub const SITE_ORIGIN: &str = "https://icp.test";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLayout {
    Timer,
    Table,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeFixture {
    Scored { site_key: String, action: String },
    Image { data_url: String },
}

/// Builds a scripted copy of the whole booking flow, driven by the probes in
/// a [`CitaConfig`]. Every page hop happens `hop` after the triggering
/// interaction.
#[derive(Debug, Clone)]
pub struct BookingSite {
    config: CitaConfig,
    hop: Duration,
    procedures: Vec<(String, String)>,
    offices: Vec<(String, String)>,
    slots: SlotLayout,
    challenge: Option<ChallengeFixture>,
    sms_code: bool,
    confirmed: bool,
    after_region: Option<PageFixture>,
    after_personal_info: Option<PageFixture>,
    after_slot: Option<PageFixture>,
}

impl BookingSite {
    pub fn new(config: &CitaConfig) -> Self {
        Self {
            config: config.clone(),
            hop: Duration::from_millis(800),
            procedures: vec![
                ("-1".into(), "Seleccionar".into()),
                ("4010".into(), "POLICIA-EXPEDICION DE TARJETA".into()),
                ("4036".into(), "POLICIA - TOMA DE HUELLAS".into()),
            ],
            offices: vec![
                ("".into(), "Seleccionar oficina".into()),
                ("16".into(), "CNP RAMBLA GUIPUSCOA, 74".into()),
                ("18".into(), "CNP SABADELL, BATLLEVELL, 115".into()),
            ],
            slots: SlotLayout::Timer,
            challenge: None,
            sms_code: false,
            confirmed: true,
            after_region: None,
            after_personal_info: None,
            after_slot: None,
        }
    }

    pub fn page(path: &str) -> PageFixture {
        PageFixture::at(format!("{SITE_ORIGIN}{path}"))
    }

    pub fn hop(mut self, hop: Duration) -> Self {
        self.hop = hop;
        self
    }

    pub fn procedures<I, V, T>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = (V, T)>,
        V: Into<String>,
        T: Into<String>,
    {
        self.procedures = pairs(options);
        self
    }

    pub fn offices<I, V, T>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = (V, T)>,
        V: Into<String>,
        T: Into<String>,
    {
        self.offices = pairs(options);
        self
    }

    pub fn slots(mut self, layout: SlotLayout) -> Self {
        self.slots = layout;
        self
    }

    pub fn challenge(mut self, challenge: ChallengeFixture) -> Self {
        self.challenge = Some(challenge);
        self
    }

    pub fn sms_code(mut self) -> Self {
        self.sms_code = true;
        self
    }

    pub fn unconfirmed(mut self) -> Self {
        self.confirmed = false;
        self
    }

    /// Page served after the region form is accepted.
    pub fn after_region(mut self, page: PageFixture) -> Self {
        self.after_region = Some(page);
        self
    }

    /// Page served after the personal-info form is submitted.
    pub fn after_personal_info(mut self, page: PageFixture) -> Self {
        self.after_personal_info = Some(page);
        self
    }

    /// Page served once the booking dialog is accepted.
    pub fn after_slot(mut self, page: PageFixture) -> Self {
        self.after_slot = Some(page);
        self
    }

    pub fn session(&self) -> ScriptedSession {
        ScriptedSession::new(self.blank())
    }

    pub fn factory(self) -> ScriptedSessionFactory {
        ScriptedSessionFactory::repeating(move || self.session())
    }

    fn blank(&self) -> PageFixture {
        let start = self.config.workflow.start_url.clone();
        PageFixture::at("about:blank")
            .with_dom_size(40)
            .on_navigate(start, self.region())
    }

    fn region(&self) -> PageFixture {
        let site = &self.config.site;
        let province = self.config.workflow.province.clone();
        let next = self.after_region.clone().unwrap_or_else(|| self.procedure());
        PageFixture::at(self.config.workflow.start_url.clone())
            .titled("Cita previa")
            .with_content("<form>Seleccione la provincia</form>")
            .with_dom_size(4_000)
            .with_select(
                site.region_select.clone(),
                [
                    ("/icpplustiem/citar?p=2".to_string(), "Albacete".to_string()),
                    ("/icpplustieb/citar?p=8".to_string(), province),
                ],
            )
            .with_element(site.accept_button.clone())
            .on_click(site.accept_button.clone(), self.hop, next)
    }

    fn procedure(&self) -> PageFixture {
        let site = &self.config.site;
        Self::page("/icpplustieb/citar?p=8&locale=es")
            .titled("Cita previa")
            .with_content("<form>Tramites disponibles</form>")
            .with_dom_size(6_000)
            .with_select(site.procedure_select.clone(), self.procedures.clone())
            .with_element(site.accept_button.clone())
            .on_click(site.accept_button.clone(), self.hop, self.info())
    }

    fn info(&self) -> PageFixture {
        let site = &self.config.site;
        Self::page(&site.info_location)
            .with_content("<div>Información del trámite</div>")
            .with_dom_size(7_000)
            .with_element(site.enter_button.clone())
            .on_click(site.enter_button.clone(), self.hop, self.entry())
    }

    fn entry(&self) -> PageFixture {
        let site = &self.config.site;
        let country = self.config.identity.country_code.clone();
        let next = self
            .after_personal_info
            .clone()
            .unwrap_or_else(|| self.appointment());
        Self::page(&site.entry_location)
            .with_content("<form>Datos personales</form>")
            .with_dom_size(8_000)
            .with_element(site.applicant_id_input.clone())
            .with_attribute(site.applicant_name_input.clone(), "pattern", "[A-Z]*")
            .with_select(
                site.country_select.clone(),
                [("".to_string(), "Seleccionar".to_string()), (country, "PAIS".to_string())],
            )
            .with_element(site.personal_submit_button.clone())
            .on_click(site.personal_submit_button.clone(), self.hop, next)
    }

    fn appointment(&self) -> PageFixture {
        let site = &self.config.site;
        Self::page(&site.appointment_location)
            .with_content("<form>Solicitar cita</form>")
            .with_dom_size(5_000)
            .with_element(site.query_button.clone())
            .on_click(site.query_button.clone(), self.hop, self.office())
    }

    /// Same location as the appointment page; only the document is replaced.
    fn office(&self) -> PageFixture {
        let site = &self.config.site;
        Self::page(&site.appointment_location)
            .with_content("<form>Seleccione la oficina</form>")
            .with_dom_size(9_000)
            .with_select(site.office_select.clone(), self.offices.clone())
            .with_element(site.office_next_button.clone())
            .on_click(site.office_next_button.clone(), self.hop, self.contact())
    }

    fn contact(&self) -> PageFixture {
        let site = &self.config.site;
        let mut page = Self::page("/icpplustieb/acVerFormulario")
            .with_content("<form>Datos de contacto</form>")
            .with_dom_size(10_000)
            .with_element(site.phone_input.clone());
        for email in &site.email_inputs {
            page = page.with_element(email.clone());
        }
        page.on_script(site.contact_submit_script.clone(), self.hop, self.slot_offer())
    }

    fn slot_offer(&self) -> PageFixture {
        let site = &self.config.site;
        let booked = self.after_slot.clone().unwrap_or_else(|| self.confirmation());
        let page = Self::page("/icpplustieb/acOfertarCita").with_dom_size(12_000);
        let page = match self.slots {
            SlotLayout::Timer => page
                .with_content(format!("<p>{}</p>", site.timer_slots_marker))
                .with_fixture(site.timer_slot_radios.clone(), ElementFixture::repeated(2))
                .on_script_confirm(site.timer_submit_script.clone(), booked),
            SlotLayout::Table => page
                .with_content(format!("<p>{}</p>", site.table_slots_marker))
                .with_fixture(
                    slot_cells_selector(&site.slot_table),
                    ElementFixture::repeated(2).with_attribute("id", "HUECO12345"),
                )
                .on_script_confirm("confirmarHueco", booked),
            SlotLayout::Empty => {
                page.with_content("<p>En este momento no hay citas disponibles.</p>")
            }
        };
        match &self.challenge {
            Some(ChallengeFixture::Scored { site_key, action }) => page
                .with_attribute(site.recaptcha_key_input.clone(), "value", site_key.clone())
                .with_attribute(site.recaptcha_action_input.clone(), "value", action.clone()),
            Some(ChallengeFixture::Image { data_url }) => page
                .with_attribute(site.image_captcha.clone(), "src", data_url.clone())
                .with_element(site.image_captcha_input.clone()),
            None => page,
        }
    }

    fn confirmation(&self) -> PageFixture {
        let site = &self.config.site;
        let mut page = Self::page("/icpplustieb/acGrabarCita")
            .with_content(format!("<p>{}</p>", site.confirmation_marker))
            .with_dom_size(11_000)
            .with_element(site.confirm_button.clone());
        for (index, checkbox) in site.consent_checkboxes.iter().enumerate() {
            page = page.with_fixture(checkbox.clone(), ElementFixture::single().checked(index > 0));
        }
        if self.sms_code {
            page = page.with_element(site.sms_code_input.clone());
        }
        page.on_click(site.confirm_button.clone(), self.hop, self.done())
    }

    fn done(&self) -> PageFixture {
        let content = if self.confirmed {
            format!("<h1>{}</h1>", self.config.site.confirmed_marker)
        } else {
            "<h1>Error al grabar la cita</h1>".to_string()
        };
        Self::page("/icpplustieb/acImprimir")
            .with_content(content)
            .with_dom_size(3_000)
    }
}

fn pairs<I, V, T>(options: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (V, T)>,
    V: Into<String>,
    T: Into<String>,
{
    options
        .into_iter()
        .map(|(value, text)| (value.into(), text.into()))
        .collect()
}

/// A configuration that validates and points at [`SITE_ORIGIN`].
pub fn sample_config() -> CitaConfig {
    let mut config = CitaConfig::default();
    config.identity.applicant_id = "Y1234567Z".into();
    config.identity.full_name = "ANA PEREZ".into();
    config.identity.country_code = "248".into();
    config.identity.phone = "600000000".into();
    config.identity.email = "ana@example.com".into();
    config.workflow.start_url = format!("{SITE_ORIGIN}/icpplustiem/index.html");
    config.workflow.province = "Barcelona".into();
    config.captcha.mode = crate::config::CaptchaMode::Manual;
    config.timing.max_retries = 5;
    config.timing.wait_seconds = 5;
    config.timing.transition_timeout_seconds = 3;
    config.human.pause_ms = [10, 20];
    config.human.keystroke_pause_ms = [1, 5];
    config.human.hover_ms = 5;
    config
}
