use std::{collections::BTreeMap, sync::Arc};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::models::{Activity, Weekday};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopularActivity {
    pub id: String,
    pub title: String,
    pub enrolled: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub total_activities: u64,
    pub total_capacity: u64,
    pub total_enrolled: u64,
    /// Enrolled over capacity, `0.0` when there is no capacity at all.
    pub occupancy: f64,
    pub full_activities: u64,
    pub per_day: BTreeMap<Weekday, u64>,
    pub most_popular: Option<PopularActivity>,
}

/// One task per aggregate over a shared immutable snapshot.
pub async fn compute_statistics(snapshot: Arc<[Activity]>) -> Statistics {
    let capacity = spawn_aggregate(&snapshot, total_capacity);
    let enrolled = spawn_aggregate(&snapshot, total_enrolled);
    let full = spawn_aggregate(&snapshot, full_activities);
    let days = spawn_aggregate(&snapshot, per_day);
    let popular = spawn_aggregate(&snapshot, most_popular);

    let total_capacity = join_aggregate(&snapshot, capacity, total_capacity).await;
    let total_enrolled = join_aggregate(&snapshot, enrolled, total_enrolled).await;
    let full_activities = join_aggregate(&snapshot, full, full_activities).await;
    let per_day = join_aggregate(&snapshot, days, per_day).await;
    let most_popular = join_aggregate(&snapshot, popular, most_popular).await;

    let occupancy = if total_capacity == 0 {
        0.0
    } else {
        total_enrolled as f64 / total_capacity as f64
    };

    Statistics {
        total_activities: snapshot.len() as u64,
        total_capacity,
        total_enrolled,
        occupancy,
        full_activities,
        per_day,
        most_popular,
    }
}

fn spawn_aggregate<T>(snapshot: &Arc<[Activity]>, aggregate: fn(&[Activity]) -> T) -> JoinHandle<T>
where
    T: Send + 'static,
{
    let snapshot = Arc::clone(snapshot);
    tokio::spawn(async move { aggregate(&snapshot) })
}

async fn join_aggregate<T>(
    snapshot: &Arc<[Activity]>,
    handle: JoinHandle<T>,
    aggregate: fn(&[Activity]) -> T,
) -> T {
    match handle.await {
        Ok(value) => value,
        Err(e) => {
            warn!("Statistics task failed, recomputing inline: {e}");
            aggregate(snapshot)
        }
    }
}

fn total_capacity(activities: &[Activity]) -> u64 {
    activities
        .iter()
        .map(|activity| activity.fields.capacity as u64)
        .sum()
}

fn total_enrolled(activities: &[Activity]) -> u64 {
    activities
        .iter()
        .map(|activity| activity.enrolled_count() as u64)
        .sum()
}

fn full_activities(activities: &[Activity]) -> u64 {
    activities.iter().filter(|activity| activity.is_full()).count() as u64
}

fn per_day(activities: &[Activity]) -> BTreeMap<Weekday, u64> {
    let mut days: BTreeMap<Weekday, u64> = Weekday::ALL.into_iter().map(|day| (day, 0)).collect();

    for activity in activities {
        *days.entry(activity.fields.day).or_default() += 1;
    }

    days
}

// Ties go to the lowest id so the answer is stable.
fn most_popular(activities: &[Activity]) -> Option<PopularActivity> {
    activities
        .iter()
        .filter(|activity| activity.enrolled_count() > 0)
        .max_by(|a, b| {
            a.enrolled_count()
                .cmp(&b.enrolled_count())
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|activity| PopularActivity {
            id: activity.id.clone(),
            title: activity.fields.title.clone(),
            enrolled: activity.enrolled_count(),
        })
}
