use std::{future::Future, time::Duration};

use chrono::NaiveTime;
use tokio::time::timeout;
use uuid::Uuid;

use crate::{
    error::ValidationError,
    models::{ActivityFields, NewActivity, Weekday},
};

pub fn new_activity_id() -> String {
    Uuid::new_v4().to_string()
}

/// Splits `id1,id2,...` into trimmed, non-empty, de-duplicated ids.
pub fn parse_ids(raw: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();

    for id in raw.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }

    ids
}

/// Runs `future` with a deadline, mapping expiry to `on_timeout`.
pub async fn with_deadline<T, E, F>(deadline: Duration, on_timeout: E, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    timeout(deadline, future).await.unwrap_or(Err(on_timeout))
}

pub fn validate_activity(input: &NewActivity) -> Result<ActivityFields, ValidationError> {
    let title = input.title.trim();
    if title.is_empty() {
        return Err(ValidationError::TitleRequired);
    }

    let instructor = input.instructor.trim();
    if instructor.is_empty() {
        return Err(ValidationError::InstructorRequired);
    }

    let start_time = input.start_time.trim();
    let end_time = input.end_time.trim();
    if start_time.is_empty() || end_time.is_empty() {
        return Err(ValidationError::TimeRequired);
    }

    let start = parse_clock(start_time)?;
    let end = parse_clock(end_time)?;
    if end <= start {
        return Err(ValidationError::EndBeforeStart);
    }

    if input.capacity < 0 {
        return Err(ValidationError::CapacityNegative);
    }

    let day = input.day.trim();
    if day.is_empty() {
        return Err(ValidationError::DayRequired);
    }
    let day: Weekday = day
        .parse()
        .map_err(|_| ValidationError::InvalidDay(day.to_string()))?;

    Ok(ActivityFields {
        title: title.to_string(),
        description: input.description.trim().to_string(),
        instructor: instructor.to_string(),
        day,
        start_time: start.format("%H:%M").to_string(),
        end_time: end.format("%H:%M").to_string(),
        capacity: input.capacity.min(u32::MAX as i64) as u32,
        photo_url: input.photo_url.trim().to_string(),
    })
}

pub fn validate_participant(participant: &str) -> Result<&str, ValidationError> {
    let participant = participant.trim();

    if participant.is_empty() {
        return Err(ValidationError::ParticipantRequired);
    }

    Ok(participant)
}

fn parse_clock(value: &str) -> Result<NaiveTime, ValidationError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|_| ValidationError::InvalidTime(value.to_string()))
}
