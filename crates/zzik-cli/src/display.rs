//! Vertical card display for fraud results and replayed check-ins.

use zzik_checkin::{CheckInResponse, ErrorBody};
use zzik_guard::{Assessment, FraudResult};

use crate::scenario::Outcome;

const LABEL_WIDTH: usize = 22;

fn row(label: &str, value: impl std::fmt::Display) {
    println!("  {label:<LABEL_WIDTH$} {value}");
}

fn opt_row<T: std::fmt::Display>(label: &str, value: Option<T>) {
    if let Some(v) = value {
        row(label, v);
    }
}

/// Print a fraud score with its assessment and flags.
pub fn print_fraud_card(result: &FraudResult, assessment: &Assessment) {
    println!("=== Fraud check: {} ===", if result.passed { "PASS" } else { "BLOCK" });
    println!();

    println!("Score");
    row("score", format!("{:.3}", result.score));
    row("risk", assessment.risk.as_str());
    row("assessment", assessment.message);

    println!("Signals");
    row("gps_accuracy_m", result.details.gps_accuracy);
    row("cell_distance", result.details.cell_distance);
    row("distance_m", format!("{:.1}", result.details.distance_meters));
    opt_row("velocity_m_s", result.details.velocity.map(|v| format!("{v:.1}")));
    opt_row(
        "since_last_s",
        result.details.time_since_last_check_in.map(|s| format!("{s:.0}")),
    );

    if !result.flags.is_empty() {
        println!("Flags");
        for flag in &result.flags {
            println!(
                "  [{:<8}] {:<14} {}",
                flag.severity.as_str(),
                flag.kind.as_str(),
                flag.message
            );
        }
    }
}

/// Print one replayed step.
pub fn print_outcome_card(outcome: &Outcome) {
    let verdict = match &outcome.result {
        Ok(_) => "ACCEPTED".to_string(),
        Err(body) => format!("REJECTED ({})", body.code),
    };
    println!(
        "=== Step {}: {} @ {} ===",
        outcome.step, outcome.user_id, outcome.poi_id
    );
    println!("{verdict}  at {}", outcome.at.to_rfc3339());
    match &outcome.result {
        Ok(resp) => print_response(resp),
        Err(body) => print_error(body),
    }
    println!();
}

fn print_response(resp: &CheckInResponse) {
    row("check_in_id", &resp.check_in_id);
    row("method", resp.method.as_str());
    row("tier", resp.tier.as_str());
    row("tokens_earned", resp.tokens_earned);
    row("fraud_score", format!("{:.3}", resp.fraud_score));
    opt_row("reward_points", resp.reward_points);
    row(
        "check_ins_remaining",
        resp.check_ins_remaining
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string()),
    );
    if let Some(streak) = &resp.streak {
        if streak.streak_updated {
            row("streak", streak.current_streak);
            opt_row("milestone", streak.milestone.as_deref());
        }
    }
    row("message", &resp.message);
}

fn print_error(body: &ErrorBody) {
    row("message", &body.message);
    if let Some(details) = &body.details {
        row("details", details);
    }
}

/// One-line tally printed after a replay.
pub fn summary_line(outcomes: &[Outcome]) -> String {
    let accepted = outcomes.iter().filter(|o| o.result.is_ok()).count();
    format!(
        "{} steps: {} accepted, {} rejected",
        outcomes.len(),
        accepted,
        outcomes.len() - accepted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn outcome(step: usize, ok: bool) -> Outcome {
        Outcome {
            step,
            at: Utc::now(),
            user_id: "u1".into(),
            poi_id: "p1".into(),
            result: if ok {
                Ok(CheckInResponse {
                    success: true,
                    check_in_id: format!("c{step}"),
                    tokens_earned: 0,
                    reward_points: None,
                    message: "ok".into(),
                    tier: zzik_core::Tier::Free,
                    method: zzik_core::CheckInMethod::Gps,
                    check_ins_remaining: Some(2),
                    fraud_score: 0.0,
                    streak: None,
                })
            } else {
                Err(ErrorBody {
                    code: "too_far".into(),
                    message: "You are 120m away.".into(),
                    details: None,
                })
            },
        }
    }

    #[test]
    fn summary_counts_outcomes() {
        let outcomes = vec![outcome(1, true), outcome(2, false), outcome(3, true)];
        assert_eq!(summary_line(&outcomes), "3 steps: 2 accepted, 1 rejected");
    }
}
