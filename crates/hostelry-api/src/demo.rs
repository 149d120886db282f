//! Built-in hostel workflows exposed by the CLI.
//!
//! `fail` names a step whose handler errors on every attempt, which makes
//! the retry, rollback and optional-step paths observable from the shell.

use std::time::Duration;

use anyhow::bail;
use hostelry_core::workflow::definition::WorkflowDefinition;
use hostelry_core::workflow::step::Step;
use hostelry_types::workflow::{RetryPolicy, WorkflowPriority};
use serde_json::json;
use uuid::Uuid;

pub const ONBOARD_ADMIN: &str = "onboard_admin";
pub const BOOKING_APPROVAL: &str = "booking_approval";

fn injected(step: &str, fail: Option<&str>) -> bool {
    fail == Some(step)
}

/// Every built-in definition, with `fail` injected where it names a step.
pub fn definitions(fail: Option<&str>) -> anyhow::Result<Vec<WorkflowDefinition>> {
    Ok(vec![onboard_admin(fail)?, booking_approval(fail)?])
}

fn onboard_admin(fail: Option<&str>) -> anyhow::Result<WorkflowDefinition> {
    let create_fails = injected("create_account", fail);
    let role_fails = injected("assign_role", fail);
    let welcome_fails = injected("send_welcome", fail);

    let definition = WorkflowDefinition::new(ONBOARD_ADMIN, "Onboard Hostel Admin")
        .with_description("Create an admin account, grant the hostel role and send a welcome mail")
        .with_priority(WorkflowPriority::High)
        .with_tag("admin")
        .add_validator(|ctx| async move { Ok(ctx.contains_key("email")) })
        .add_step(
            Step::new("create_account", move |ctx| async move {
                if create_fails {
                    bail!("account service unavailable");
                }
                let email = ctx.get_str("email").unwrap_or_default();
                Ok(json!({ "user_id": Uuid::now_v7().to_string(), "email": email }))
            })
            .with_retries(1, Duration::from_millis(100), 1.0)
            .with_rollback(|ctx| async move {
                if let Some(account) = ctx.get("create_account_result") {
                    tracing::info!(user_id = %account["user_id"], "deleting admin account");
                }
                Ok(())
            })
            .with_tag("accounts"),
        )?
        .add_step(
            Step::new("assign_role", move |ctx| async move {
                if role_fails {
                    bail!("role directory rejected the grant");
                }
                let role = ctx.get_str("role").unwrap_or_else(|| "warden".to_string());
                Ok(json!({ "role": role }))
            })
            .with_retries(2, Duration::from_millis(200), 2.0)
            .with_rollback(|_ctx| async move {
                tracing::info!("revoking hostel role");
                Ok(())
            }),
        )?
        .add_step(
            Step::new("send_welcome", move |ctx| async move {
                if welcome_fails {
                    bail!("mail relay timed out");
                }
                let email = ctx.get_str("email").unwrap_or_default();
                Ok(json!({ "sent_to": email }))
            })
            .optional()
            .with_retry(RetryPolicy::none())
            .with_timeout(Duration::from_secs(10))
            .with_tag("notifications"),
        )?;

    Ok(definition)
}

fn booking_approval(fail: Option<&str>) -> anyhow::Result<WorkflowDefinition> {
    let availability_fails = injected("check_availability", fail);
    let reserve_fails = injected("reserve_bed", fail);
    let deposit_fails = injected("charge_deposit", fail);
    let notify_fails = injected("notify_guest", fail);

    let definition = WorkflowDefinition::new(BOOKING_APPROVAL, "Booking Approval")
        .with_description("Check availability, hold a bed, take the deposit and tell the guest")
        .with_max_concurrent_executions(20)
        .with_max_execution_time(Duration::from_secs(120))
        .with_tag("bookings")
        .add_step(
            Step::new("check_availability", move |ctx| async move {
                if availability_fails {
                    bail!("no beds free for the requested nights");
                }
                let nights = ctx.get("nights").and_then(|v| v.as_u64()).unwrap_or(1);
                Ok(json!({ "available": true, "nights": nights }))
            })
            .with_retries(1, Duration::from_millis(250), 1.0)
            .validate_result(|result| result["available"] == json!(true)),
        )?
        .add_step(
            Step::new("reserve_bed", move |_ctx| async move {
                if reserve_fails {
                    bail!("bed hold conflicted with another booking");
                }
                Ok(json!({ "bed": "B-12" }))
            })
            .with_retries(3, Duration::from_millis(100), 2.0)
            .with_rollback(|ctx| async move {
                if let Some(hold) = ctx.get("reserve_bed_result") {
                    tracing::info!(bed = %hold["bed"], "releasing bed hold");
                }
                Ok(())
            }),
        )?
        .add_step(
            Step::new("charge_deposit", move |ctx| async move {
                if deposit_fails {
                    bail!("card declined");
                }
                let amount = ctx.get("deposit").unwrap_or(json!(0));
                Ok(json!({ "charged": amount }))
            })
            .when_expr("context.deposit")
            .with_retry(RetryPolicy::none())
            .with_rollback(|_ctx| async move {
                tracing::info!("refunding deposit");
                Ok(())
            }),
        )?
        .add_step(
            Step::new("notify_guest", move |_ctx| async move {
                if notify_fails {
                    bail!("sms gateway error");
                }
                Ok(json!({ "channel": "sms" }))
            })
            .with_retries(1, Duration::from_millis(500), 1.0)
            .optional(),
        )?;

    Ok(definition)
}
