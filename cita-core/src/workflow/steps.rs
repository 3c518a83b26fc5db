use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use serde_json::Value;
use tracing::{debug, info};

use crate::browser::{BrowserResult, OptionChoice, SelectOption};
use crate::captcha::GateVerdict;

use super::classifier::{OutcomeTag, StepExpectation};
use super::outcome::{FailureReason, Outcome};
use super::step::{Commit, Step, StepContext, StepResult};

const RELAX_NAME_PATTERN: &str = "function() { this.setAttribute('pattern', '[a-zA-Z ]*'); }";
const DISPATCH_CHANGE: &str =
    "function() { this.dispatchEvent(new Event('change', { bubbles: true })); }";
const IS_CHECKED: &str = "function() { return this.checked; }";
const SLOT_ID_PREFIX: &str = "HUECO";

/// The booking workflow, in execution order.
pub fn default_steps() -> Vec<Box<dyn Step>> {
    vec![
        Box::new(SelectRegion),
        Box::new(SelectProcedure),
        Box::new(EnterSection),
        Box::new(SubmitPersonalInfo),
        Box::new(AwaitQueryControl),
        Box::new(ActivateQueryControl),
        Box::new(SelectOffice),
        Box::new(SubmitContact),
        Box::new(SelectSlot),
        Box::new(ConfirmAppointment),
    ]
}

/// Bookable cells inside the slot table.
pub fn slot_cells_selector(table: &str) -> String {
    format!("{table} [id^={SLOT_ID_PREFIX}]")
}

fn option_probe(selector: &str, wanted: &str) -> String {
    format!("{selector} option {wanted:?}")
}

pub struct SelectRegion;

#[async_trait(?Send)]
impl Step for SelectRegion {
    fn name(&self) -> &'static str {
        "select_region"
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> BrowserResult<StepResult> {
        let config = ctx.config();
        let site = &config.site;
        let wait = ctx.wait();

        ctx.session().navigate(&config.workflow.start_url).await?;
        ctx.wait_ready().await?;

        let Some(region) = ctx.wait_for(&site.region_select, wait).await? else {
            return Ok(ctx.missing(&site.region_select));
        };
        let province = &config.workflow.province;
        let choice = OptionChoice::VisibleText(province.clone());
        if ctx.select(region, &choice).await?.is_none() {
            return Ok(ctx.missing(&option_probe(&site.region_select, province)));
        }
        ctx.pause().await;

        let Some(accept) = ctx.wait_for(&site.accept_button, wait).await? else {
            return Ok(ctx.missing(&site.accept_button));
        };
        let commit = ctx.commit_click(accept).await?;
        ctx.conclude(&commit).await
    }
}

pub struct SelectProcedure;

#[async_trait(?Send)]
impl Step for SelectProcedure {
    fn name(&self) -> &'static str {
        "select_procedure"
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> BrowserResult<StepResult> {
        let config = ctx.config();
        let site = &config.site;
        let wait = ctx.wait();

        let Some(select) = ctx.wait_for(&site.procedure_select, wait).await? else {
            return Ok(ctx.missing(&site.procedure_select));
        };
        // The first entry is the "choose one" placeholder.
        let offered = ctx.session().options(select).await?;
        if offered.len() < 2 {
            return Ok(ctx.fail(FailureReason::NoProceduresOffered));
        }
        let choice = match &config.workflow.procedure {
            Some(text) => OptionChoice::VisibleText(text.clone()),
            None => OptionChoice::Last,
        };
        let Some(picked) = ctx.select(select, &choice).await? else {
            let wanted = config.workflow.procedure.as_deref().unwrap_or("last");
            return Ok(ctx.missing(&option_probe(&site.procedure_select, wanted)));
        };
        debug!(procedure = %picked.text, "procedure selected");
        ctx.pause().await;

        let Some(accept) = ctx.wait_for(&site.accept_button, wait).await? else {
            return Ok(ctx.missing(&site.accept_button));
        };
        let commit = ctx.commit_click(accept).await?;
        ctx.conclude(&commit).await
    }
}

pub struct EnterSection;

#[async_trait(?Send)]
impl Step for EnterSection {
    fn name(&self) -> &'static str {
        "enter_section"
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> BrowserResult<StepResult> {
        let site = &ctx.config().site;
        let wait = ctx.wait();

        if !ctx.wait_for_location(&site.info_location, wait).await? {
            return Ok(ctx.missing(&site.info_location));
        }
        let Some(enter) = ctx.wait_for(&site.enter_button, wait).await? else {
            return Ok(ctx.missing(&site.enter_button));
        };
        ctx.session().scroll_into_view(enter).await?;
        ctx.pause().await;

        let commit = ctx.commit_click(enter).await?;
        if !commit.transitioned() {
            return Ok(StepResult::Terminal(Outcome::NoTransition));
        }
        ctx.wait_ready().await?;
        let arrived = ctx
            .wait_for_location_or(&site.entry_location, &site.applicant_id_input, wait)
            .await?;
        if !arrived {
            debug!("entry form not confirmed; classifying current page");
        }
        ctx.classify(&StepExpectation::guards_only()).await
    }
}

pub struct SubmitPersonalInfo;

#[async_trait(?Send)]
impl Step for SubmitPersonalInfo {
    fn name(&self) -> &'static str {
        "submit_personal_info"
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> BrowserResult<StepResult> {
        let config = ctx.config();
        let site = &config.site;
        let identity = &config.identity;
        let wait = ctx.wait();

        let Some(id_input) = ctx.wait_for(&site.applicant_id_input, wait).await? else {
            return Ok(ctx.missing(&site.applicant_id_input));
        };
        ctx.fill(id_input, &identity.applicant_id).await?;

        let Some(name_input) = ctx.wait_for(&site.applicant_name_input, wait).await? else {
            return Ok(ctx.missing(&site.applicant_name_input));
        };
        if let Err(err) = ctx.session().call_on(name_input, RELAX_NAME_PATTERN).await {
            debug!(error = %err, "name pattern left in place");
        }
        ctx.fill(name_input, &identity.full_name).await?;
        ctx.session().call_on(name_input, DISPATCH_CHANGE).await?;

        let Some(country) = ctx.wait_for(&site.country_select, wait).await? else {
            return Ok(ctx.missing(&site.country_select));
        };
        let choice = OptionChoice::Value(identity.country_code.clone());
        if ctx.select(country, &choice).await?.is_none() {
            return Ok(ctx.missing(&option_probe(&site.country_select, &identity.country_code)));
        }
        ctx.pause().await;

        let Some(submit) = ctx.wait_for(&site.personal_submit_button, wait).await? else {
            return Ok(ctx.missing(&site.personal_submit_button));
        };
        let commit = ctx.commit_click(submit).await?;
        if !commit.transitioned() {
            return Ok(StepResult::Terminal(Outcome::NoTransition));
        }
        ctx.wait_ready().await?;

        let controls_present = ctx
            .session()
            .find_element(&site.personal_submit_button)
            .await?
            .is_some();
        let expectation = StepExpectation::guards_only()
            .location(site.validation_location.clone(), OutcomeTag::ValidationFailed)
            .location(site.appointment_location.clone(), OutcomeTag::Advanced)
            .stay_guard(commit.from.clone(), controls_present);
        ctx.classify(&expectation).await
    }
}

pub struct AwaitQueryControl;

#[async_trait(?Send)]
impl Step for AwaitQueryControl {
    fn name(&self) -> &'static str {
        "await_query_control"
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> BrowserResult<StepResult> {
        let config = ctx.config();
        let button = &config.site.query_button;
        let timeout = config.timing.query_control_timeout();
        match ctx.wait_for(button, timeout).await? {
            Some(_) => Ok(StepResult::Proceed),
            None => Ok(ctx.missing(button)),
        }
    }
}

pub struct ActivateQueryControl;

#[async_trait(?Send)]
impl Step for ActivateQueryControl {
    fn name(&self) -> &'static str {
        "activate_query_control"
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> BrowserResult<StepResult> {
        let button = &ctx.config().site.query_button;
        let Some(handle) = ctx.session().find_element(button).await? else {
            return Ok(ctx.missing(button));
        };
        let commit = ctx.commit_click(handle).await?;
        ctx.conclude(&commit).await
    }
}

pub struct SelectOffice;

#[async_trait(?Send)]
impl Step for SelectOffice {
    fn name(&self) -> &'static str {
        "select_office"
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> BrowserResult<StepResult> {
        let config = ctx.config();
        let site = &config.site;
        let workflow = &config.workflow;
        let wait = ctx.wait();

        let Some(select) = ctx.wait_for(&site.office_select, wait).await? else {
            return Ok(ctx.missing(&site.office_select));
        };
        let offered = ctx.session().options(select).await?;
        let chosen = choose_office(
            &offered,
            &workflow.preferred_offices,
            &workflow.excluded_offices,
            &mut thread_rng(),
        );
        let Some(office) = chosen else {
            return Ok(ctx.fail(FailureReason::NoOfficesOffered));
        };
        if ctx
            .select(select, &OptionChoice::Value(office.value.clone()))
            .await?
            .is_none()
        {
            return Ok(ctx.missing(&option_probe(&site.office_select, &office.value)));
        }
        info!(office = %office.text.trim(), "office selected");
        ctx.pause().await;

        let Some(next) = ctx.wait_for(&site.office_next_button, wait).await? else {
            return Ok(ctx.missing(&site.office_next_button));
        };
        let commit = ctx.commit_click(next).await?;
        ctx.conclude(&commit).await
    }
}

/// Picks the office to book at. A leading option with an empty value is the
/// placeholder. Preferences are tried in order and matched case-insensitively
/// against the visible text; otherwise a random non-excluded office is used.
pub fn choose_office<R: Rng + ?Sized>(
    offered: &[SelectOption],
    preferred: &[String],
    excluded: &[String],
    rng: &mut R,
) -> Option<SelectOption> {
    let skip = usize::from(offered.first().map_or(false, |first| first.value.is_empty()));
    let mentions = |office: &SelectOption, needle: &str| {
        office.text.to_lowercase().contains(&needle.trim().to_lowercase())
    };
    let candidates: Vec<&SelectOption> = offered[skip..]
        .iter()
        .filter(|office| !excluded.iter().any(|needle| mentions(office, needle)))
        .collect();

    preferred
        .iter()
        .find_map(|needle| {
            candidates
                .iter()
                .find(|office| mentions(office, needle))
                .copied()
        })
        .or_else(|| candidates.choose(rng).copied())
        .cloned()
}

pub struct SubmitContact;

#[async_trait(?Send)]
impl Step for SubmitContact {
    fn name(&self) -> &'static str {
        "submit_contact"
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> BrowserResult<StepResult> {
        let config = ctx.config();
        let site = &config.site;
        let wait = ctx.wait();

        let Some(phone) = ctx.wait_for(&site.phone_input, wait).await? else {
            return Ok(ctx.missing(&site.phone_input));
        };
        ctx.fill(phone, &config.identity.phone).await?;
        for selector in &site.email_inputs {
            if let Some(email) = ctx.session().find_element(selector).await? {
                ctx.fill(email, &config.identity.email).await?;
            }
        }
        ctx.pause().await;

        let commit = ctx.commit_script(&site.contact_submit_script).await?;
        ctx.conclude(&commit).await
    }
}

pub struct SelectSlot;

impl SelectSlot {
    async fn clear_challenge(ctx: &mut StepContext<'_>) -> BrowserResult<Option<StepResult>> {
        let gate = &ctx.services().gate;
        match gate.resolve(ctx.session()).await? {
            GateVerdict::Failed(failure) => Ok(Some(ctx.fail(FailureReason::Captcha(failure)))),
            GateVerdict::Cleared | GateVerdict::NotPresent => Ok(None),
        }
    }

    /// Runs the page's booking script, dismissing the confirm dialog it raises.
    async fn submit(ctx: &mut StepContext<'_>, script: &str) -> BrowserResult<Commit> {
        let signal = ctx.arm(None).await?;
        if ctx.session().evaluate_accepting_dialogs(script).await? {
            debug!("booking dialog accepted");
        }
        Ok(ctx.await_transition(&signal).await)
    }

    async fn first_table_slot(ctx: &mut StepContext<'_>, table: &str) -> BrowserResult<Option<String>> {
        let cells = ctx.session().find_elements(&slot_cells_selector(table)).await?;
        for cell in cells {
            if let Some(id) = ctx.session().attribute(cell, "id").await? {
                if id.starts_with(SLOT_ID_PREFIX) {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait(?Send)]
impl Step for SelectSlot {
    fn name(&self) -> &'static str {
        "select_slot"
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> BrowserResult<StepResult> {
        let site = &ctx.config().site;
        let text = ctx.session().body_text().await?;

        let script = if text.contains(&site.timer_slots_marker) {
            let radios = ctx.session().find_elements(&site.timer_slot_radios).await?;
            let Some(first) = radios.first().copied() else {
                return Ok(ctx.fail(FailureReason::NoSlotsOffered));
            };
            ctx.session().click(first).await?;
            info!(offered = radios.len(), "timed slot selected");
            site.timer_submit_script.clone()
        } else if text.contains(&site.table_slots_marker) {
            let Some(id) = Self::first_table_slot(ctx, &site.slot_table).await? else {
                return Ok(ctx.fail(FailureReason::NoSlotsOffered));
            };
            info!(slot = %id, "table slot selected");
            let number = id.strip_prefix(SLOT_ID_PREFIX).unwrap_or(&id);
            format!("confirmarHueco({{id: '{id}'}}, {number});")
        } else {
            return Ok(ctx.fail(FailureReason::NoSlotsOffered));
        };

        if let Some(failed) = Self::clear_challenge(ctx).await? {
            return Ok(failed);
        }
        let commit = Self::submit(ctx, &script).await?;
        ctx.conclude(&commit).await
    }
}

pub struct ConfirmAppointment;

#[async_trait(?Send)]
impl Step for ConfirmAppointment {
    fn name(&self) -> &'static str {
        "confirm_appointment"
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> BrowserResult<StepResult> {
        let site = &ctx.config().site;
        let wait = ctx.wait();

        let text = ctx.session().body_text().await?;
        if !text.contains(&site.confirmation_marker) {
            return Ok(ctx.fail(FailureReason::NotOnConfirmation));
        }

        if let Some(input) = ctx.session().find_element(&site.sms_code_input).await? {
            info!("sms verification required");
            let operator = &ctx.services().operator;
            let code = operator.read_line("SMS code: ").await?;
            ctx.fill(input, &code).await?;
        }

        for selector in &site.consent_checkboxes {
            let Some(checkbox) = ctx.session().find_element(selector).await? else {
                continue;
            };
            let checked = ctx.session().call_on(checkbox, IS_CHECKED).await?;
            if checked != Value::Bool(true) {
                ctx.session().click(checkbox).await?;
            }
        }

        let Some(confirm) = ctx.wait_for(&site.confirm_button, wait).await? else {
            return Ok(ctx.missing(&site.confirm_button));
        };
        let commit = ctx.commit_click(confirm).await?;
        if !commit.transitioned() {
            debug!("confirmation click produced no visible transition");
        }
        ctx.wait_ready().await?;
        if let StepResult::Terminal(outcome) =
            ctx.classify(&StepExpectation::guards_only()).await?
        {
            return Ok(StepResult::Terminal(outcome));
        }

        let text = ctx.session().body_text().await?;
        if text.contains(&site.confirmed_marker) {
            info!("appointment confirmed");
            Ok(StepResult::Proceed)
        } else {
            Ok(ctx.fail(FailureReason::NotConfirmed))
        }
    }
}
