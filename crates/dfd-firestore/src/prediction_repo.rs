//! Prediction history stored as one document per classified upload.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dfd_models::{PredictionId, PredictionRecord};
use tracing::{info, warn};

use crate::client::FirestoreClient;
use crate::error::FirestoreResult;
use crate::types::{Direction, Document, StructuredQuery, ToFirestoreValue, Value};

pub const DEFAULT_COLLECTION: &str = "predictions";

/// Repository for prediction records.
#[derive(Clone)]
pub struct PredictionRepository {
    client: FirestoreClient,
    collection: String,
}

impl PredictionRepository {
    pub fn new(client: FirestoreClient, collection: impl Into<String>) -> Self {
        Self {
            client,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Store a record under its own ID.
    pub async fn record(&self, record: &PredictionRecord) -> FirestoreResult<()> {
        self.client
            .create_document(&self.collection, record.id.as_str(), &record_to_document(record))
            .await?;
        info!(
            prediction_id = %record.id,
            label = %record.label,
            confidence = record.confidence,
            "Stored prediction"
        );
        Ok(())
    }

    /// Round-trip to the collection. A missing probe document still counts
    /// as reachable.
    pub async fn ping(&self) -> FirestoreResult<()> {
        self.client.get_document(&self.collection, "_health").await.map(|_| ())
    }

    /// Most recent records first, all of them when `limit` is `None`.
    /// Documents that do not parse are skipped.
    pub async fn list_recent(&self, limit: Option<usize>) -> FirestoreResult<Vec<PredictionRecord>> {
        let mut query =
            StructuredQuery::collection(&self.collection).order_by("timestamp", Direction::Descending);
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        let documents = self.client.run_query("", query).await?;

        Ok(documents
            .iter()
            .filter_map(|doc| match document_to_record(doc) {
                Some(record) => Some(record),
                None => {
                    warn!(document = ?doc.name, "Skipping unreadable prediction document");
                    None
                }
            })
            .collect())
    }
}

pub(crate) fn record_to_document(record: &PredictionRecord) -> Document {
    let mut fields: HashMap<String, Value> = HashMap::new();
    fields.insert("filename".into(), record.filename.to_firestore_value());
    fields.insert("label".into(), record.label.as_str().to_firestore_value());
    fields.insert("confidence".into(), record.confidence.to_firestore_value());
    fields.insert("timestamp".into(), record.timestamp.to_firestore_value());

    let optional = [
        ("duration", record.duration.map(|d| d.to_firestore_value())),
        ("user_email", record.user_email.as_ref().map(|s| s.to_firestore_value())),
        ("user_name", record.user_name.as_ref().map(|s| s.to_firestore_value())),
        ("user_profile", record.user_profile.as_ref().map(|s| s.to_firestore_value())),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            fields.insert(key.into(), value);
        }
    }

    Document::new(fields)
}

pub(crate) fn document_to_record(doc: &Document) -> Option<PredictionRecord> {
    Some(PredictionRecord {
        id: PredictionId(doc.id()?.to_string()),
        filename: doc.get::<String>("filename").unwrap_or_default(),
        label: doc.get::<String>("label")?.parse().ok()?,
        confidence: doc.get::<f64>("confidence")?,
        duration: doc.get::<f64>("duration"),
        user_email: doc.get::<String>("user_email"),
        user_name: doc.get::<String>("user_name"),
        user_profile: doc.get::<String>("user_profile"),
        timestamp: doc.get::<DateTime<Utc>>("timestamp")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfd_models::{Label, Prediction, PredictionMetadata};

    fn sample_record() -> PredictionRecord {
        PredictionRecord::new(
            Prediction::new(Label::Fake, 0.87),
            PredictionMetadata {
                filename: "clip.mp4".into(),
                duration: Some(12.5),
                user_email: Some("viewer@example.com".into()),
                ..Default::default()
            },
        )
    }

    fn named(mut doc: Document, id: &str) -> Document {
        doc.name = Some(format!(
            "projects/p/databases/(default)/documents/{}/{}",
            DEFAULT_COLLECTION, id
        ));
        doc
    }

    #[test]
    fn test_document_fields() {
        let record = sample_record();
        let doc = record_to_document(&record);
        let fields = doc.fields.as_ref().unwrap();

        assert_eq!(fields["label"], Value::StringValue("FAKE".into()));
        assert_eq!(fields["confidence"], Value::DoubleValue(0.87));
        assert!(matches!(fields["timestamp"], Value::TimestampValue(_)));
        assert!(fields.contains_key("user_email"));
        assert!(!fields.contains_key("user_name"));
    }

    #[test]
    fn test_document_back_to_record() {
        let record = sample_record();
        let doc = named(record_to_document(&record), record.id.as_str());

        let parsed = document_to_record(&doc).unwrap();
        assert_eq!(parsed.id, record.id);
        assert_eq!(parsed.label, Label::Fake);
        assert_eq!(parsed.confidence, 0.87);
        assert_eq!(parsed.duration, Some(12.5));
        assert_eq!(parsed.user_email.as_deref(), Some("viewer@example.com"));
        assert_eq!(parsed.user_profile, None);
        assert_eq!(parsed.timestamp.timestamp(), record.timestamp.timestamp());
    }

    #[test]
    fn test_unreadable_documents_are_rejected() {
        let record = sample_record();

        let unnamed = record_to_document(&record);
        assert!(document_to_record(&unnamed).is_none());

        let mut bad_label = named(record_to_document(&record), "x");
        bad_label
            .fields
            .as_mut()
            .unwrap()
            .insert("label".into(), Value::StringValue("MAYBE".into()));
        assert!(document_to_record(&bad_label).is_none());
    }
}
