use std::fmt::Write;

use chrono::{DateTime, Utc};
use cronfleet_store::FleetSnapshot;

/// Plain-text rendering of a snapshot for terminals.
pub fn render(snap: &FleetSnapshot) -> String {
    let mut out = String::new();
    let now = snap.taken_at;

    let _ = writeln!(out, "as of {}", snap.taken_at.to_rfc3339());
    let _ = writeln!(out);

    let _ = writeln!(out, "runners ({}):", snap.heartbeats.len());
    for hb in &snap.heartbeats {
        let stale = snap
            .stale_runners
            .iter()
            .any(|s| s.runner_id == hb.runner_id);
        let _ = writeln!(
            out,
            "  {:<24} {:>8} ago {} {}",
            hb.runner_id.as_str(),
            age(now, hb.last_seen_at),
            if stale { "STALE" } else { "ok   " },
            hb.status_note
        );
    }
    if snap.stale_runners.is_empty() {
        let _ = writeln!(out, "  no runner silent for more than {}s", snap.stale_after_secs);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "leases ({}):", snap.leases.len());
    for view in &snap.leases {
        let l = &view.lease;
        let _ = writeln!(
            out,
            "  {:<24} {:<9} token={:<6} holder={} expires={}{}",
            l.job_id.as_str(),
            l.status.to_string(),
            l.fencing_token,
            l.holder_id,
            l.expires_at.to_rfc3339(),
            if view.live { "" } else { " (not live)" }
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "recent executions ({}):", snap.recent.len());
    for rec in &snap.recent {
        let took = (rec.finished_at - rec.started_at).num_milliseconds() as f64 / 1000.0;
        let _ = writeln!(
            out,
            "  {} {:<24} {:<8} {:>8.1}s token={} runner={}{}",
            rec.finished_at.to_rfc3339(),
            rec.job_id.as_str(),
            rec.outcome.to_string(),
            took,
            rec.fencing_token,
            rec.runner_id,
            rec.detail
                .as_deref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default()
        );
    }
    out
}

fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    match secs {
        s if s < 120 => format!("{s}s"),
        s if s < 7_200 => format!("{}m", s / 60),
        s => format!("{}h", s / 3_600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cronfleet_core::{JobId, RunnerId};
    use cronfleet_store::{ExecutionRecord, Heartbeat, Lease, LeaseStatus, LeaseView, Outcome};

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn render_marks_stale_runner_and_dead_lease() {
        let pi = Heartbeat {
            runner_id: RunnerId::from("pi"),
            last_seen_at: t(0),
            status_note: "idle".into(),
        };
        let desktop = Heartbeat {
            runner_id: RunnerId::from("desktop"),
            last_seen_at: t(290),
            status_note: "running: card_sync".into(),
        };
        let snap = FleetSnapshot {
            taken_at: t(300),
            stale_after_secs: 90,
            heartbeats: vec![desktop.clone(), pi.clone()],
            stale_runners: vec![pi],
            leases: vec![LeaseView {
                lease: Lease {
                    job_id: JobId::from("card_sync"),
                    holder_id: RunnerId::from("pi"),
                    fencing_token: 4,
                    acquired_at: t(0),
                    expires_at: t(60),
                    status: LeaseStatus::Held,
                },
                live: false,
            }],
            recent: vec![ExecutionRecord {
                id: 1,
                job_id: JobId::from("card_sync"),
                runner_id: RunnerId::from("pi"),
                fencing_token: 4,
                started_at: t(0),
                finished_at: t(10),
                outcome: Outcome::Timeout,
                detail: Some("deadline exceeded after 10s".into()),
            }],
        };

        let text = render(&snap);
        assert!(text.contains("STALE"));
        assert!(text.contains("5m ago"));
        assert!(text.contains("(not live)"));
        assert!(text.contains("token=4"));
        assert!(text.contains("(deadline exceeded after 10s)"));
    }
}
