use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::warn;
use uuid::Uuid;

use common::model::schedule::parse_crontab;
use common::model::{Schedule, Scraper};

/// Per-scraper fire times.
///
/// Interval schedules are drift-free: the next fire is the previous one
/// plus the interval, not "now plus interval". When fires were missed (the
/// scheduler was in standby, or the scraper was blocked) only a single
/// catch-up fire happens and the cadence restarts from now. Crontab fires
/// are the next matching time strictly after now.
pub struct TriggerState {
    entries: HashMap<Uuid, Entry>,
}

struct Entry {
    schedule: Schedule,
    crontab: Option<String>,
    next_fire: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(scraper: &Scraper, now: DateTime<Utc>) -> Self {
        let mut entry = Entry {
            schedule: scraper.schedule,
            crontab: scraper.schedule_crontab.clone(),
            next_fire: None,
        };
        entry.next_fire = entry.first_fire(now);
        entry
    }

    fn matches(&self, scraper: &Scraper) -> bool {
        self.schedule == scraper.schedule && self.crontab == scraper.schedule_crontab
    }

    fn first_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.schedule {
            Schedule::Inactive => None,
            Schedule::Crontab => self.next_crontab(now),
            _ => self.schedule.interval().map(|interval| now + interval),
        }
    }

    fn next_crontab(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let expr = self.crontab.as_deref()?;
        match parse_crontab(expr) {
            Ok(schedule) => schedule.after(&after).next(),
            Err(e) => {
                warn!("skipping crontab trigger with invalid expression '{expr}': {e}");
                None
            }
        }
    }

    /// Advances past a fire at `now`, coalescing any backlog of missed
    /// fires into the one that just happened.
    fn advance(&mut self, now: DateTime<Utc>) {
        self.next_fire = match self.schedule {
            Schedule::Inactive => None,
            Schedule::Crontab => self.next_crontab(now),
            _ => self.schedule.interval().map(|interval| {
                let mut next = self.next_fire.unwrap_or(now) + interval;
                if next <= now {
                    next = now + interval;
                }
                next
            }),
        };
    }
}

impl Default for TriggerState {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerState {
    pub fn new() -> Self {
        TriggerState {
            entries: HashMap::new(),
        }
    }

    /// Reconciles trigger entries with the current set of scrapers:
    /// inactive and deleted scrapers lose their entries, changed schedules
    /// restart their cadence, new scrapers start one.
    pub fn sync(&mut self, scrapers: &[Scraper], now: DateTime<Utc>) {
        let mut seen = std::collections::HashSet::new();
        for scraper in scrapers {
            seen.insert(scraper.id);
            if scraper.schedule == Schedule::Inactive {
                self.entries.remove(&scraper.id);
                continue;
            }
            match self.entries.get(&scraper.id) {
                Some(entry) if entry.matches(scraper) => {}
                _ => {
                    self.entries.insert(scraper.id, Entry::new(scraper, now));
                }
            }
        }
        self.entries.retain(|id, _| seen.contains(id));
    }

    /// Scraper ids due at `now`. Each returned id fires exactly once and
    /// its entry is advanced past `now`.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            if let Some(next_fire) = entry.next_fire {
                if next_fire <= now {
                    due.push(*id);
                    entry.advance(now);
                }
            }
        }
        due.sort();
        due
    }

    pub fn next_fire(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.entries.get(&id).and_then(|entry| entry.next_fire)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
