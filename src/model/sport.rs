//! Live win-probability model for sports.
//!
//! The model treats the remaining-game score margin as normally distributed
//! around the current adjusted lead. Volatility decays with remaining time
//! under a sport-specific exponent, possession carries a sport-specific
//! point value (situation-dependent for football), and large deficits are
//! penalised by a catch-up term once the required points-per-possession
//! becomes unrealistic.

use std::collections::HashMap;

use statrs::distribution::{ContinuousCDF, Normal};

use super::ProbabilityModel;
use crate::domain::{
    Event, EventState, FieldSituation, ModelOutput, Possession, Probability, ResolutionStatus,
    Sport, SportState, StateData,
};

/// Tuning parameters for one sport.
#[derive(Debug, Clone)]
pub struct SportParams {
    /// Standard deviation of the final margin over a full game, in points.
    pub full_game_sigma: f64,
    /// Exponent on the remaining-time fraction in the volatility decay.
    pub decay_exponent: f64,
    /// Home-court advantage in points, applied pro rata to remaining time.
    pub home_court_points: f64,
    /// Expected points for having possession (non-football).
    pub possession_value: f64,
    /// Average seconds per possession, for catch-up feasibility.
    pub avg_possession_secs: f64,
    /// Exponent applied to the trailing side's comeback probability.
    pub catchup_exponent: f64,
    /// Points-per-possession beyond which a comeback is penalised.
    pub catchup_ppp_threshold: f64,
}

impl SportParams {
    #[must_use]
    pub fn for_sport(sport: Sport) -> Self {
        match sport {
            Sport::Nba => Self {
                full_game_sigma: 12.0,
                decay_exponent: 0.5,
                home_court_points: 2.5,
                possession_value: 1.1,
                avg_possession_secs: 14.5,
                catchup_exponent: 1.6,
                catchup_ppp_threshold: 2.2,
            },
            Sport::Ncaab => Self {
                full_game_sigma: 11.0,
                decay_exponent: 0.55,
                home_court_points: 3.5,
                possession_value: 1.0,
                avg_possession_secs: 17.0,
                catchup_exponent: 1.7,
                catchup_ppp_threshold: 2.0,
            },
            Sport::Nfl => Self {
                full_game_sigma: 13.5,
                decay_exponent: 0.6,
                home_court_points: 0.0,
                possession_value: 1.8,
                avg_possession_secs: 165.0,
                catchup_exponent: 1.9,
                catchup_ppp_threshold: 7.5,
            },
            Sport::Ncaaf => Self {
                full_game_sigma: 15.0,
                decay_exponent: 0.6,
                home_court_points: 0.0,
                possession_value: 1.9,
                avg_possession_secs: 160.0,
                catchup_exponent: 1.8,
                catchup_ppp_threshold: 7.5,
            },
            Sport::Nhl => Self {
                full_game_sigma: 2.1,
                decay_exponent: 0.45,
                home_court_points: 0.0,
                possession_value: 0.05,
                avg_possession_secs: 40.0,
                catchup_exponent: 1.5,
                catchup_ppp_threshold: 0.6,
            },
            Sport::Mlb => Self {
                full_game_sigma: 3.8,
                decay_exponent: 0.5,
                home_court_points: 0.0,
                possession_value: 0.25,
                avg_possession_secs: 1_200.0,
                catchup_exponent: 1.5,
                catchup_ppp_threshold: 1.4,
            },
        }
    }
}

/// Expected-points value of possessing the ball at a football field
/// position, keyed by yard line, down, and distance.
#[must_use]
pub fn football_possession_value(situation: FieldSituation) -> f64 {
    // Yards from the opponent end zone, bucketed to red zone / midfield /
    // own territory; value degrades with down and long distance.
    let field_value = match situation.yard_line {
        0..=20 => 4.2,
        21..=40 => 2.8,
        41..=60 => 1.7,
        61..=80 => 0.8,
        _ => 0.2,
    };
    let down_factor = match situation.down {
        1 => 1.0,
        2 => 0.9,
        3 => 0.7,
        _ => 0.45,
    };
    let distance_factor = if situation.distance >= 10 { 0.85 } else { 1.0 };
    field_value * down_factor * distance_factor
}

/// Sport win-probability model.
pub struct SportModel {
    params: HashMap<Sport, SportParams>,
    normal: Normal,
}

impl SportModel {
    #[must_use]
    pub fn with_defaults() -> Self {
        let params = [
            Sport::Nba,
            Sport::Ncaab,
            Sport::Nfl,
            Sport::Ncaaf,
            Sport::Nhl,
            Sport::Mlb,
        ]
        .into_iter()
        .map(|s| (s, SportParams::for_sport(s)))
        .collect();

        Self {
            params,
            normal: Normal::new(0.0, 1.0).expect("unit normal"),
        }
    }

    fn evaluate(&self, sport: Sport, state: &SportState, is_final: bool) -> Option<f64> {
        let params = self.params.get(&sport)?;
        let regulation = f64::from(sport.regulation_seconds());

        // Reject state the scoreboard cannot have produced.
        if f64::from(state.seconds_remaining) > regulation * 2.0 {
            return None;
        }
        if state.score_a > 300 || state.score_b > 300 {
            return None;
        }

        let margin = f64::from(state.score_a) - f64::from(state.score_b);

        if is_final {
            return Some(if margin > 0.0 {
                1.0
            } else if margin < 0.0 {
                0.0
            } else {
                0.5
            });
        }

        let remaining = f64::from(state.seconds_remaining).min(regulation);
        let remaining_frac = remaining / regulation;

        if remaining <= 0.0 {
            return Some(match margin.partial_cmp(&0.0)? {
                std::cmp::Ordering::Greater => 1.0,
                std::cmp::Ordering::Less => 0.0,
                std::cmp::Ordering::Equal => 0.5,
            });
        }

        // Home-court advantage is worth its full value over a whole game;
        // only the remaining share still applies.
        let mut adjusted = margin + params.home_court_points * remaining_frac;

        adjusted += match state.possession {
            Some(Possession::EntityA) => self.possession_points(sport, params, state),
            Some(Possession::EntityB) => -self.possession_points(sport, params, state),
            None => 0.0,
        };

        let sigma = (params.full_game_sigma * remaining_frac.powf(params.decay_exponent))
            .max(1e-6);
        let mut p = self.normal.cdf(adjusted / sigma);

        // Catch-up difficulty: when the trailing side needs an unrealistic
        // scoring rate, shrink its comeback probability.
        let deficit = margin.abs();
        if deficit > 0.0 {
            let possessions_left = (remaining / params.avg_possession_secs).max(0.5);
            let required_ppp = deficit / possessions_left;
            if required_ppp > params.catchup_ppp_threshold {
                if margin > 0.0 {
                    // entity_a leads: comeback chance is 1 - p.
                    p = 1.0 - (1.0 - p).powf(params.catchup_exponent);
                } else {
                    p = p.powf(params.catchup_exponent);
                }
            }
        }

        Some(p.clamp(0.0, 1.0))
    }

    fn possession_points(&self, sport: Sport, params: &SportParams, state: &SportState) -> f64 {
        match (sport, state.situation) {
            (Sport::Nfl | Sport::Ncaaf, Some(situation)) => football_possession_value(situation),
            _ => params.possession_value,
        }
    }
}

impl ProbabilityModel for SportModel {
    fn probability(&self, event: &Event, state: &EventState) -> ModelOutput {
        let Some(sport) = event.market_type.sport() else {
            return ModelOutput::Unknown;
        };
        let StateData::Sport(ref sport_state) = state.data else {
            return ModelOutput::Unknown;
        };

        let is_final = matches!(state.status, ResolutionStatus::Final);
        match self.evaluate(sport, sport_state, is_final) {
            Some(p) => ModelOutput::Known(Probability::new(
                event.event_id.clone(),
                event.entity_a.clone(),
                p,
            )),
            None => ModelOutput::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventId, MarketType};
    use chrono::Utc;

    fn event(sport: Sport) -> Event {
        Event {
            event_id: EventId::from("e1"),
            market_type: MarketType::Sport {
                sport,
                league: sport.as_str().into(),
            },
            entity_a: "Home".into(),
            entity_b: Some("Away".into()),
            scheduled_start_utc: Utc::now(),
        }
    }

    fn nba_state(
        score_a: u32,
        score_b: u32,
        seconds_remaining: u32,
        possession: Option<Possession>,
    ) -> EventState {
        EventState {
            event_id: EventId::from("e1"),
            status: ResolutionStatus::Live,
            data: StateData::Sport(SportState {
                score_a,
                score_b,
                period: 4,
                seconds_remaining,
                possession,
                situation: None,
            }),
            fetched_at: Utc::now(),
            fetch_latency_ms: 25,
        }
    }

    fn prob(model: &SportModel, event: &Event, state: &EventState) -> f64 {
        model.probability(event, state).into_known().unwrap().p
    }

    #[test]
    fn leading_team_is_favored() {
        let model = SportModel::with_defaults();
        let e = event(Sport::Nba);
        let p = prob(&model, &e, &nba_state(88, 80, 240, None));
        assert!(p > 0.85, "8-point lead with 4 minutes left, got {p}");
        assert!(p < 1.0);
    }

    #[test]
    fn tied_game_is_near_even_with_home_court() {
        let model = SportModel::with_defaults();
        let e = event(Sport::Nba);
        let p = prob(&model, &e, &nba_state(50, 50, 1_440, None));
        // Home court keeps the home side slightly above a coin flip.
        assert!(p > 0.5);
        assert!(p < 0.62);
    }

    #[test]
    fn lead_matters_more_late() {
        let model = SportModel::with_defaults();
        let e = event(Sport::Nba);
        let early = prob(&model, &e, &nba_state(60, 54, 1_800, None));
        let late = prob(&model, &e, &nba_state(96, 90, 120, None));
        assert!(late > early, "same margin should be safer late");
    }

    #[test]
    fn possession_shifts_probability() {
        let model = SportModel::with_defaults();
        let e = event(Sport::Nba);
        let with_ball = prob(
            &model,
            &e,
            &nba_state(80, 78, 300, Some(Possession::EntityA)),
        );
        let without = prob(
            &model,
            &e,
            &nba_state(80, 78, 300, Some(Possession::EntityB)),
        );
        assert!(with_ball > without);
    }

    #[test]
    fn football_possession_uses_field_position() {
        let red_zone = football_possession_value(FieldSituation {
            yard_line: 8,
            down: 1,
            distance: 8,
        });
        let own_territory = football_possession_value(FieldSituation {
            yard_line: 85,
            down: 3,
            distance: 12,
        });
        assert!(red_zone > own_territory * 3.0);
    }

    #[test]
    fn blowout_late_is_near_certain() {
        let model = SportModel::with_defaults();
        let e = event(Sport::Nba);
        let p = prob(&model, &e, &nba_state(110, 82, 360, None));
        assert!(p > 0.999, "28-point lead with 6 minutes left, got {p}");
    }

    #[test]
    fn final_state_collapses_to_outcome() {
        let model = SportModel::with_defaults();
        let e = event(Sport::Nba);
        let mut state = nba_state(101, 99, 0, None);
        state.status = ResolutionStatus::Final;
        assert_eq!(prob(&model, &e, &state), 1.0);
    }

    #[test]
    fn absurd_state_is_unknown() {
        let model = SportModel::with_defaults();
        let e = event(Sport::Nba);
        // Scoreboard glitch: 999 points.
        let state = nba_state(999, 80, 240, None);
        assert_eq!(model.probability(&e, &state), ModelOutput::Unknown);
    }

    #[test]
    fn crypto_state_is_unknown_for_sport_model() {
        let model = SportModel::with_defaults();
        let e = event(Sport::Nba);
        let state = EventState {
            event_id: EventId::from("e1"),
            status: ResolutionStatus::Live,
            data: StateData::Crypto(crate::domain::CryptoState {
                spot: 100_000.0,
                reference: 98_000.0,
                seconds_to_expiry: 3_600,
                realized_vol: 0.4,
            }),
            fetched_at: Utc::now(),
            fetch_latency_ms: 10,
        };
        assert_eq!(model.probability(&e, &state), ModelOutput::Unknown);
    }
}
