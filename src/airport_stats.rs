use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// Direction of an aircraft movement counted against an airport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Movement {
    Arrival,
    Departure,
}

impl Movement {
    pub fn from_is_arrival(is_arrival: bool) -> Self {
        if is_arrival {
            Movement::Arrival
        } else {
            Movement::Departure
        }
    }

    pub fn is_arrival(self) -> bool {
        matches!(self, Movement::Arrival)
    }
}

impl std::fmt::Display for Movement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Movement::Arrival => write!(f, "arrival"),
            Movement::Departure => write!(f, "departure"),
        }
    }
}

/// One +1 contribution to an airport's daily counters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatIncrement {
    pub airport_code: String,
    pub day: NaiveDate,
    pub movement: Movement,
}

impl StatIncrement {
    pub fn new(airport_code: impl Into<String>, day: NaiveDate, movement: Movement) -> Self {
        Self {
            airport_code: airport_code.into(),
            day,
            movement,
        }
    }
}

/// Arrival and departure counts of one airport on one UTC day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirportDailyStats {
    pub airport_code: String,
    pub day: NaiveDate,
    pub arrival_count: i64,
    pub departure_count: i64,
}

impl AirportDailyStats {
    /// Row created by the first contribution for an (airport, day)
    pub fn first_contribution(increment: &StatIncrement) -> Self {
        let mut stats = Self {
            airport_code: increment.airport_code.clone(),
            day: increment.day,
            arrival_count: 0,
            departure_count: 0,
        };
        stats.apply(increment.movement);
        stats
    }

    pub fn apply(&mut self, movement: Movement) {
        match movement {
            Movement::Arrival => self.arrival_count += 1,
            Movement::Departure => self.departure_count += 1,
        }
    }
}

/// Diesel model for the airport_daily_stats table
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::airport_daily_stats)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AirportDailyStatsModel {
    pub airport_code: String,
    pub day: NaiveDate,
    pub arrival_count: i64,
    pub departure_count: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<AirportDailyStatsModel> for AirportDailyStats {
    fn from(model: AirportDailyStatsModel) -> Self {
        Self {
            airport_code: model.airport_code,
            day: model.day,
            arrival_count: model.arrival_count,
            departure_count: model.departure_count,
        }
    }
}

impl From<&StatIncrement> for AirportDailyStatsModel {
    fn from(increment: &StatIncrement) -> Self {
        let stats = AirportDailyStats::first_contribution(increment);
        Self {
            airport_code: stats.airport_code,
            day: stats.day,
            arrival_count: stats.arrival_count,
            departure_count: stats.departure_count,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_contribution_counts_one_side() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();

        let arrival = AirportDailyStats::first_contribution(&StatIncrement::new(
            "EDDF",
            day,
            Movement::Arrival,
        ));
        assert_eq!((arrival.arrival_count, arrival.departure_count), (1, 0));

        let departure = AirportDailyStats::first_contribution(&StatIncrement::new(
            "EDDF",
            day,
            Movement::Departure,
        ));
        assert_eq!((departure.arrival_count, departure.departure_count), (0, 1));
    }
}
