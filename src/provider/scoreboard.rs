//! Sports scoreboard poller.
//!
//! One HTTPS request per sport per tick; the response is decomposed
//! client-side into per-event states and new plays (diffed by play id).
//! Failures retry with capped backoff; sustained failure trips a circuit
//! breaker that surfaces an unhealthy heartbeat.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::PollCadence;
use crate::bus::{Bus, Heartbeat};
use crate::domain::{
    EventId, EventState, FieldSituation, Play, PlayId, PlayKind, Possession, ResolutionStatus,
    Sport, SportState, StateData,
};
use crate::error::Result;
use crate::store::Repository;

#[derive(Debug, Deserialize)]
struct Scoreboard {
    events: Vec<ScoreboardEvent>,
}

#[derive(Debug, Deserialize)]
struct ScoreboardEvent {
    id: String,
    status: String,
    period: u8,
    clock_seconds: u32,
    home_score: u32,
    away_score: u32,
    #[serde(default)]
    possession: Option<String>,
    #[serde(default)]
    yard_line: Option<u8>,
    #[serde(default)]
    down: Option<u8>,
    #[serde(default)]
    distance: Option<u8>,
    #[serde(default)]
    plays: Vec<ScoreboardPlay>,
}

#[derive(Debug, Deserialize)]
struct ScoreboardPlay {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    points: u8,
}

/// Scoreboard provider: polls each configured sport and publishes states
/// and plays.
pub struct ScoreboardProvider {
    http: HttpClient,
    base_url: String,
    sports: Vec<Sport>,
    cadence: PollCadence,
    bus: Bus,
    repo: Arc<dyn Repository>,
    /// Plays already emitted, per event; replaying a known play id is a
    /// no-op.
    seen_plays: HashMap<EventId, HashSet<PlayId>>,
    consecutive_failures: u32,
    breaker_threshold: u32,
}

impl ScoreboardProvider {
    #[must_use]
    pub fn new(
        http: HttpClient,
        base_url: String,
        sports: Vec<Sport>,
        cadence: PollCadence,
        bus: Bus,
        repo: Arc<dyn Repository>,
    ) -> Self {
        Self {
            http,
            base_url,
            sports,
            cadence,
            bus,
            repo,
            seen_plays: HashMap::new(),
            consecutive_failures: 0,
            breaker_threshold: 5,
        }
    }

    /// Poll loop with dynamic cadence.
    pub async fn run(mut self) -> Result<()> {
        info!(sports = ?self.sports, "scoreboard provider started");

        loop {
            let mut any_live = false;
            let mut any_crunch = false;

            for sport in self.sports.clone() {
                match self.poll_sport(sport).await {
                    Ok((live, crunch)) => {
                        self.consecutive_failures = 0;
                        any_live |= live;
                        any_crunch |= crunch;
                    }
                    Err(e) => {
                        self.consecutive_failures += 1;
                        warn!(
                            sport = %sport,
                            error = %e,
                            failures = self.consecutive_failures,
                            "scoreboard poll failed"
                        );
                        if self.consecutive_failures >= self.breaker_threshold {
                            self.bus.publish_heartbeat(Heartbeat::unhealthy(
                                "event_provider",
                                format!("{} consecutive poll failures", self.consecutive_failures),
                            ));
                        }
                    }
                }
            }

            if self.consecutive_failures == 0 {
                self.bus
                    .publish_heartbeat(Heartbeat::healthy("event_provider"));
            }

            // Failure backoff rides the idle cadence, capped.
            let interval = if self.consecutive_failures > 0 {
                let backoff =
                    self.cadence.live_secs * 2u64.pow(self.consecutive_failures.min(4));
                std::time::Duration::from_secs(backoff.min(self.cadence.idle_secs))
            } else {
                self.cadence.interval(any_live, any_crunch)
            };
            tokio::time::sleep(interval).await;
        }
    }

    /// One request for the sport's whole scoreboard. Returns whether any
    /// event is live and whether any is in the crunch window.
    pub async fn poll_sport(&mut self, sport: Sport) -> Result<(bool, bool)> {
        let started = std::time::Instant::now();
        let url = format!("{}/scoreboard/{}", self.base_url, sport.as_str());
        let scoreboard: Scoreboard = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let latency_ms = u32::try_from(started.elapsed().as_millis()).unwrap_or(u32::MAX);

        let mut any_live = false;
        let mut any_crunch = false;

        for raw in scoreboard.events {
            let (state, plays) = self.decompose(sport, raw, latency_ms);
            if state.is_live() {
                any_live = true;
                if let StateData::Sport(ref s) = state.data {
                    any_crunch |= self
                        .cadence
                        .is_crunch(s.seconds_remaining, sport.regulation_seconds());
                }
            }

            if let Err(e) = self.repo.record_event_state(&state).await {
                debug!(error = %e, "event state not recorded");
            }
            self.bus.publish_state(state);

            for play in plays {
                if let Err(e) = self.repo.record_play(&play).await {
                    debug!(error = %e, "play not recorded");
                }
                self.bus.publish_play(play);
            }
        }

        Ok((any_live, any_crunch))
    }

    /// Turn one scoreboard row into an event state plus its new plays.
    fn decompose(
        &mut self,
        sport: Sport,
        raw: ScoreboardEvent,
        latency_ms: u32,
    ) -> (EventState, Vec<Play>) {
        let event_id = EventId::from(raw.id);

        let status = match raw.status.as_str() {
            "live" | "in_progress" => ResolutionStatus::Live,
            "final" | "completed" => ResolutionStatus::Final,
            _ => ResolutionStatus::Scheduled,
        };

        let possession = raw.possession.as_deref().and_then(|p| match p {
            "home" => Some(Possession::EntityA),
            "away" => Some(Possession::EntityB),
            _ => None,
        });

        let situation = match (sport, raw.yard_line, raw.down, raw.distance) {
            (Sport::Nfl | Sport::Ncaaf, Some(yard_line), Some(down), Some(distance)) => {
                Some(FieldSituation {
                    yard_line,
                    down,
                    distance,
                })
            }
            _ => None,
        };

        let state = EventState {
            event_id: event_id.clone(),
            status,
            data: StateData::Sport(SportState {
                score_a: raw.home_score,
                score_b: raw.away_score,
                period: raw.period,
                seconds_remaining: raw.clock_seconds,
                possession,
                situation,
            }),
            fetched_at: Utc::now(),
            fetch_latency_ms: latency_ms,
        };

        let seen = self.seen_plays.entry(event_id.clone()).or_default();
        let plays = raw
            .plays
            .into_iter()
            .filter_map(|raw_play| {
                let play_id = PlayId::from(raw_play.id);
                if !seen.insert(play_id.clone()) {
                    return None;
                }
                let kind = match raw_play.kind.as_str() {
                    "score" | "touchdown" | "field_goal" | "basket" | "goal" => PlayKind::Score {
                        points: raw_play.points,
                    },
                    "turnover" | "interception" | "fumble" | "steal" => PlayKind::Turnover,
                    "period_end" => PlayKind::PeriodEnd,
                    _ => PlayKind::Other,
                };
                Some(Play {
                    play_id,
                    event_id: event_id.clone(),
                    kind,
                    time_utc: Utc::now(),
                })
            })
            .collect();

        (state, plays)
    }

    /// Drop per-event play memory once an event is archived.
    pub fn forget_event(&mut self, event_id: &EventId) {
        self.seen_plays.remove(event_id);
    }
}
