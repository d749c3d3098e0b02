//! Which upcoming days still need their schedule fetched.

use chrono::NaiveDate;
use serde::Serialize;
use tvg_core::AirDate;
use tvg_storage::{SqliteEventStore, StoreError};

pub const DEFAULT_HORIZON_DAYS: u32 = 7;

/// Consecutive days starting today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    start: AirDate,
    days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowDay {
    pub date: AirDate,
    pub has_data: bool,
}

impl DateWindow {
    pub fn starting(today: NaiveDate, days: u32) -> Self {
        Self {
            start: AirDate::new(today),
            days,
        }
    }

    pub fn dates(&self) -> Vec<AirDate> {
        (0..u64::from(self.days))
            .map_while(|offset| self.start.plus_days(offset))
            .collect()
    }

    pub async fn annotate(
        &self,
        store: &SqliteEventStore,
        provider: &str,
    ) -> Result<Vec<WindowDay>, StoreError> {
        let mut days = Vec::with_capacity(self.days as usize);
        for date in self.dates() {
            let has_data = store.count_by_date(provider, date).await? > 0;
            days.push(WindowDay { date, has_data });
        }
        Ok(days)
    }

    /// Days in the window with no stored events for `provider`, ascending.
    pub async fn pending_dates(
        &self,
        store: &SqliteEventStore,
        provider: &str,
    ) -> Result<Vec<AirDate>, StoreError> {
        Ok(self
            .annotate(store, provider)
            .await?
            .into_iter()
            .filter(|day| !day.has_data)
            .map(|day| day.date)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tvg_core::{AirTime, BroadcastEvent};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 29).expect("date")
    }

    fn event_on(provider: &str, date: AirDate) -> BroadcastEvent {
        BroadcastEvent::new(
            provider,
            "C1",
            date,
            AirTime::new(20, 0).expect("time"),
            "Movie A",
            "https://example.test/a",
        )
    }

    #[tokio::test]
    async fn empty_store_yields_full_week_in_order() {
        let store = SqliteEventStore::open_in_memory().await.expect("store");
        let window = DateWindow::starting(today(), DEFAULT_HORIZON_DAYS);

        let pending = window.pending_dates(&store, "x").await.expect("pending");
        let rendered = pending.iter().map(ToString::to_string).collect::<Vec<_>>();

        assert_eq!(
            rendered,
            vec![
                "29.12.2025",
                "30.12.2025",
                "31.12.2025",
                "01.01.2026",
                "02.01.2026",
                "03.01.2026",
                "04.01.2026",
            ]
        );
    }

    #[tokio::test]
    async fn stored_day_is_excluded_for_its_provider_only() {
        let store = SqliteEventStore::open_in_memory().await.expect("store");
        let window = DateWindow::starting(today(), DEFAULT_HORIZON_DAYS);
        let third = window.dates()[2];
        store.insert(&event_on("x", third)).await.expect("insert");

        let pending_x = window.pending_dates(&store, "x").await.expect("pending");
        let pending_y = window.pending_dates(&store, "y").await.expect("pending");

        assert_eq!(pending_x.len(), 6);
        assert!(!pending_x.contains(&third));
        assert_eq!(pending_y.len(), 7);
    }

    #[tokio::test]
    async fn days_outside_the_window_are_ignored() {
        let store = SqliteEventStore::open_in_memory().await.expect("store");
        let window = DateWindow::starting(today(), DEFAULT_HORIZON_DAYS);
        let beyond = AirDate::new(today()).plus_days(7).expect("date");
        let before = AirDate::new(today().pred_opt().expect("date"));
        store.insert(&event_on("x", beyond)).await.expect("insert");
        store.insert(&event_on("x", before)).await.expect("insert");

        let days = window.annotate(&store, "x").await.expect("annotate");

        assert_eq!(days.len(), 7);
        assert!(days.iter().all(|d| !d.has_data));
        assert_eq!(days[0].date, AirDate::new(today()));
        assert_eq!(days[6].date.to_string(), "04.01.2026");
    }
}
