use crate::model::{EntityIdValue, FeatureView, StoredRecord, ValueWrapper};
use crate::types::Value;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureStatus {
    Present,
    NotFound,
    OutsideMaxAge,
}

/// One result column: a value, status and event time per requested entity row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureResults {
    pub values: Vec<ValueWrapper>,
    pub statuses: Vec<FeatureStatus>,
    pub event_timestamps: Vec<DateTime<Utc>>,
}

impl FeatureResults {
    fn push(&mut self, value: Value, status: FeatureStatus, event_ts: DateTime<Utc>) {
        self.values.push(ValueWrapper(value));
        self.statuses.push(status);
        self.event_timestamps.push(event_ts);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureNames {
    pub feature_names: Vec<String>,
}

/// Columnar online response. Join key columns come first, then one column per requested
/// feature in request order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OnlineFeaturesResponse {
    pub metadata: FeatureNames,
    pub results: Vec<FeatureResults>,
}

pub(crate) struct ResponseBuilder {
    response: OnlineFeaturesResponse,
    now: DateTime<Utc>,
}

impl ResponseBuilder {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self {
            response: OnlineFeaturesResponse::default(),
            now,
        }
    }

    pub(crate) fn entity_column(&mut self, join_key: &str, values: Vec<EntityIdValue>) {
        let mut column = FeatureResults::default();
        for value in values {
            column.push(
                ValueWrapper::from(value).0,
                FeatureStatus::Present,
                DateTime::UNIX_EPOCH,
            );
        }
        self.response.metadata.feature_names.push(join_key.to_string());
        self.response.results.push(column);
    }

    /// Adds the column of `feature` read from `records`, one record slot per entity row.
    pub(crate) fn feature_column(
        &mut self,
        name: String,
        view: &Arc<FeatureView>,
        feature: &str,
        records: &[Option<StoredRecord>],
    ) {
        let mut column = FeatureResults::default();
        for record in records {
            match record
                .as_ref()
                .and_then(|r| r.values.get(feature).map(|v| (r, v)))
            {
                Some((record, value)) => {
                    let status = if self.is_expired(view, record) {
                        FeatureStatus::OutsideMaxAge
                    } else {
                        FeatureStatus::Present
                    };
                    column.push(value.clone(), status, record.event_ts);
                }
                None => column.push(Value::null(), FeatureStatus::NotFound, DateTime::UNIX_EPOCH),
            }
        }
        self.response.metadata.feature_names.push(name);
        self.response.results.push(column);
    }

    fn is_expired(&self, view: &FeatureView, record: &StoredRecord) -> bool {
        view.ttl > chrono::Duration::zero() && record.event_ts + view.ttl < self.now
    }

    pub(crate) fn build(self) -> OnlineFeaturesResponse {
        self.response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataSource, Field, ValueType};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    #[test]
    fn statuses_follow_records_and_ttl() {
        let now = Utc.with_ymd_and_hms(2021, 4, 12, 12, 0, 0).unwrap();
        let view = Arc::new(FeatureView {
            name: "driver_hourly_stats".to_string(),
            entity_names: vec!["driver".to_string()],
            entity_columns: vec![Field::new("driver_id", ValueType::Int64)],
            features: vec![Field::new("conv_rate", ValueType::Float)],
            ttl: Duration::hours(1),
            source: DataSource::default(),
        });
        let record = |event_ts| StoredRecord {
            event_ts,
            created_ts: event_ts,
            values: BTreeMap::from([("conv_rate".to_string(), Value::float(0.5))]),
        };
        let records = vec![
            Some(record(now - Duration::minutes(5))),
            Some(record(now - Duration::hours(2))),
            None,
        ];
        let mut builder = ResponseBuilder::new(now);
        builder.entity_column(
            "driver_id",
            vec![
                EntityIdValue::Int(1),
                EntityIdValue::Int(2),
                EntityIdValue::Int(3),
            ],
        );
        builder.feature_column("conv_rate".to_string(), &view, "conv_rate", &records);
        let response = builder.build();

        assert_eq!(response.metadata.feature_names, vec!["driver_id", "conv_rate"]);
        assert_eq!(
            response.results[1].statuses,
            vec![
                FeatureStatus::Present,
                FeatureStatus::OutsideMaxAge,
                FeatureStatus::NotFound
            ]
        );
        assert_eq!(response.results[1].values[2], ValueWrapper(Value::null()));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["results"][0]["values"][1], 2);
        assert_eq!(json["results"][1]["statuses"][2], "NOT_FOUND");
    }
}
