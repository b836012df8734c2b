//! The scheduler (§4.7): fires daily / sunrise / sunset / interval messages
//! at each automation's mailbox, with timezone-correct local time math.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use actix::prelude::*;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use log::{info, warn};
use thiserror::Error;

use crate::automation::ScheduledMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleKind {
    Daily { time: NaiveTime },
    Sunrise { offset_minutes: i64 },
    Sunset { offset_minutes: i64 },
    Every { interval_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct ScheduleDecl {
    pub message: String,
    pub kind: ScheduleKind,
}

impl ScheduleDecl {
    pub fn daily(message: impl Into<String>, time: NaiveTime) -> Self {
        ScheduleDecl {
            message: message.into(),
            kind: ScheduleKind::Daily { time },
        }
    }

    pub fn sunrise(message: impl Into<String>, offset_minutes: i64) -> Self {
        ScheduleDecl {
            message: message.into(),
            kind: ScheduleKind::Sunrise { offset_minutes },
        }
    }

    pub fn sunset(message: impl Into<String>, offset_minutes: i64) -> Self {
        ScheduleDecl {
            message: message.into(),
            kind: ScheduleKind::Sunset { offset_minutes },
        }
    }

    pub fn every(message: impl Into<String>, interval_ms: u64) -> Self {
        ScheduleDecl {
            message: message.into(),
            kind: ScheduleKind::Every { interval_ms },
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleValidationError {
    #[error("missing message")]
    MissingMessage,
    #[error("invalid_every")]
    InvalidEvery,
}

/// Validates a declaration before it is armed. Invalid declarations are
/// logged and skipped by the caller — never fatal.
pub fn validate(decl: &ScheduleDecl) -> Result<(), ScheduleValidationError> {
    if decl.message.trim().is_empty() {
        return Err(ScheduleValidationError::MissingMessage);
    }
    if let ScheduleKind::Every { interval_ms } = decl.kind {
        if interval_ms == 0 {
            return Err(ScheduleValidationError::InvalidEvery);
        }
    }
    Ok(())
}

pub fn schedule_id(automation: &str, message: &str, declaration_index: usize) -> String {
    format!("{automation}:{message}:{declaration_index}")
}

fn resolve_timezone(name: &str) -> Tz {
    match Tz::from_str(name) {
        Ok(tz) => tz,
        Err(_) => {
            warn!("unknown timezone {name:?}, falling back to UTC");
            Tz::UTC
        }
    }
}

fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt,
        // Ambiguous local time at a DST fall-back: resolve to the later instant.
        chrono::LocalResult::Ambiguous(_earlier, later) => later,
        // DST spring-forward gap: no such local time exists; step forward
        // minute by minute (bounded) until we land past the gap.
        chrono::LocalResult::None => {
            let mut candidate = naive;
            for _ in 0..180 {
                candidate += ChronoDuration::minutes(1);
                if let chrono::LocalResult::Single(dt) = tz.from_local_datetime(&candidate) {
                    return dt;
                }
            }
            tz.from_utc_datetime(&naive)
        }
    }
}

/// Next occurrence of `time` that is strictly after `now`, in `tz`.
pub fn next_daily(tz: &Tz, time: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    let now_local = now.with_timezone(tz);
    let today = now_local.date_naive();
    let candidate_today = resolve_local(tz, NaiveDateTime::new(today, time));
    let candidate = if candidate_today > now_local {
        candidate_today
    } else {
        let tomorrow = today.succ_opt().unwrap_or(today);
        resolve_local(tz, NaiveDateTime::new(tomorrow, time))
    };
    candidate.with_timezone(&Utc)
}

#[derive(Clone, Copy, PartialEq)]
enum SunKind {
    Sunrise,
    Sunset,
}

fn raw_sun_event(lat: f64, lon: f64, date: chrono::NaiveDate, kind: SunKind) -> Option<DateTime<Utc>> {
    let (sunrise_ts, sunset_ts) = sunrise::sunrise_sunset(lat, lon, date.year(), date.month(), date.day());
    // The underlying calculation degenerates to an empty/identical window
    // during polar day or polar night; treat that as "no such event".
    if sunrise_ts == sunset_ts {
        return None;
    }
    let ts = match kind {
        SunKind::Sunrise => sunrise_ts,
        SunKind::Sunset => sunset_ts,
    };
    DateTime::<Utc>::from_timestamp(ts, 0)
}

/// Next sunrise/sunset (offset by `offset_minutes`) strictly after `now`.
/// Tries today, then tomorrow, skipping days where the event doesn't exist
/// (polar day/night). Returns `None` if neither day has the event.
pub fn next_sun_event(
    tz: &Tz,
    lat: f64,
    lon: f64,
    offset_minutes: i64,
    kind_is_sunrise: bool,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let kind = if kind_is_sunrise { SunKind::Sunrise } else { SunKind::Sunset };
    let now_local = now.with_timezone(tz);
    for day_offset in 0..2i64 {
        let date = now_local.date_naive() + ChronoDuration::days(day_offset);
        if let Some(base) = raw_sun_event(lat, lon, date, kind) {
            let candidate = base + ChronoDuration::minutes(offset_minutes);
            if candidate > now {
                return Some(candidate);
            }
        }
    }
    None
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct RegisterSchedule {
    pub automation: String,
    pub declaration_index: usize,
    pub decl: ScheduleDecl,
    pub recipient: Recipient<ScheduledMessage>,
}

struct ArmedSchedule {
    id: String,
    automation: String,
    decl: ScheduleDecl,
    recipient: Recipient<ScheduledMessage>,
}

pub struct Scheduler {
    timezone: Tz,
    location: Option<(f64, f64)>,
}

impl Scheduler {
    pub fn new(timezone_name: &str, location: Option<(f64, f64)>) -> Self {
        Scheduler {
            timezone: resolve_timezone(timezone_name),
            location,
        }
    }

    fn arm(&self, armed: ArmedSchedule, ctx: &mut Context<Self>) {
        let now = Utc::now();
        let location = match &armed.decl.kind {
            ScheduleKind::Sunrise { .. } | ScheduleKind::Sunset { .. } => match self.location {
                Some(location) => Some(location),
                None => {
                    warn!("schedule {} missing_location, not arming", armed.id);
                    return;
                }
            },
            _ => None,
        };

        let next = match &armed.decl.kind {
            ScheduleKind::Every { interval_ms } => Some(now + ChronoDuration::milliseconds(*interval_ms as i64)),
            ScheduleKind::Daily { time } => Some(next_daily(&self.timezone, *time, now)),
            ScheduleKind::Sunrise { offset_minutes } => {
                let (lat, lon) = location.unwrap();
                next_sun_event(&self.timezone, lat, lon, *offset_minutes, true, now)
            }
            ScheduleKind::Sunset { offset_minutes } => {
                let (lat, lon) = location.unwrap();
                next_sun_event(&self.timezone, lat, lon, *offset_minutes, false, now)
            }
        };

        let Some(next) = next else {
            // Polar day/night: neither today nor tomorrow has the event.
            // Retry tomorrow rather than leaving the schedule dormant forever.
            warn!("schedule {} has no upcoming occurrence, retrying in a day", armed.id);
            ctx.run_later(ChronoDuration::days(1).to_std().unwrap(), move |scheduler, ctx| {
                scheduler.arm(armed, ctx);
            });
            return;
        };

        let delay = (next - now).to_std().unwrap_or(StdDuration::ZERO);
        info!("schedule {} armed, next fire in {:?}", armed.id, delay);
        ctx.run_later(delay, move |scheduler, ctx| {
            let message = armed.decl.message.clone();
            if armed.recipient.do_send(ScheduledMessage(message)).is_err() {
                warn!("schedule {} target automation is gone, dropping message", armed.id);
            }
            scheduler.arm(armed, ctx);
        });
    }
}

impl Actor for Scheduler {
    type Context = Context<Self>;
}

impl Handler<RegisterSchedule> for Scheduler {
    type Result = ();

    fn handle(&mut self, msg: RegisterSchedule, ctx: &mut Self::Context) -> Self::Result {
        if let Err(err) = validate(&msg.decl) {
            warn!(
                "invalid schedule declaration for automation {} message {:?}: {err}",
                msg.automation, msg.decl.message
            );
            return;
        }
        let id = schedule_id(&msg.automation, &msg.decl.message, msg.declaration_index);
        self.arm(
            ArmedSchedule {
                id,
                automation: msg.automation,
                decl: msg.decl,
                recipient: msg.recipient,
            },
            ctx,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn prague() -> Tz {
        Tz::Europe__Prague
    }

    #[test]
    fn daily_fires_today_when_time_is_still_ahead() {
        let tz = prague();
        let now = tz.with_ymd_and_hms(2025, 3, 10, 13, 4, 59).unwrap().with_timezone(&Utc);
        let next = next_daily(&tz, NaiveTime::from_hms_opt(13, 5, 0).unwrap(), now);
        let expected = tz.with_ymd_and_hms(2025, 3, 10, 13, 5, 0).unwrap().with_timezone(&Utc);
        assert_eq!(next, expected);
    }

    #[test]
    fn daily_fires_tomorrow_when_time_already_passed_or_equal() {
        let tz = prague();
        let now = tz.with_ymd_and_hms(2025, 3, 10, 13, 5, 0).unwrap().with_timezone(&Utc);
        let next = next_daily(&tz, NaiveTime::from_hms_opt(13, 5, 0).unwrap(), now);
        let expected = tz.with_ymd_and_hms(2025, 3, 11, 13, 5, 0).unwrap().with_timezone(&Utc);
        assert_eq!(next, expected);
    }

    #[test]
    fn invalid_every_zero_is_rejected() {
        let decl = ScheduleDecl::every("tick", 0);
        assert_eq!(validate(&decl), Err(ScheduleValidationError::InvalidEvery));
    }

    #[test]
    fn every_one_is_accepted() {
        let decl = ScheduleDecl::every("tick", 1);
        assert_eq!(validate(&decl), Ok(()));
    }

    #[test]
    fn missing_message_is_rejected() {
        let decl = ScheduleDecl::daily("", NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(validate(&decl), Err(ScheduleValidationError::MissingMessage));
    }

    #[test]
    fn schedule_id_is_deterministic_from_its_declaration() {
        assert_eq!(schedule_id("porch_light", "dusk", 0), "porch_light:dusk:0");
        assert_ne!(schedule_id("porch_light", "dusk", 0), schedule_id("porch_light", "dusk", 1));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(resolve_timezone("Not/A_Real_Zone"), Tz::UTC);
    }
}
