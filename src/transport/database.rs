//! Document-database transport
//!
//! Bindings reference a collection in a MongoDB database: `url` is the
//! connection string, and `params` must carry `db` and `collection`. A fetch
//! materializes every document in the collection as a JSON array; a push
//! inserts the produced documents. The client is constructed lazily per
//! operation, so a registered but unused mode costs nothing.

use std::path::Path;

use mongodb::bson::{Bson, Document};
use mongodb::sync::{Client, Collection};
use serde_json::Value;
use tracing::debug;

use crate::error::SluiceError;
use crate::spec::{Binding, Port, Target};
use crate::transport::{effective_target, fetch_file_name, Transport};

pub struct MongoTransport;

impl MongoTransport {
    /// Binding parameters are checked before any client is built, so a
    /// misconfigured binding fails fast without touching the network.
    fn collection(binding: &Binding) -> Result<Collection<Document>, SluiceError> {
        let url = binding
            .url
            .as_deref()
            .ok_or_else(|| SluiceError::Transport("mongodb binding has no url".into()))?;
        let db = required_param(binding, "db")?;
        let name = required_param(binding, "collection")?;
        let client = Client::with_uri_str(url)?;
        Ok(client.database(db).collection::<Document>(name))
    }
}

fn required_param<'a>(binding: &'a Binding, key: &str) -> Result<&'a str, SluiceError> {
    binding
        .params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| SluiceError::Transport(format!("mongodb binding needs a '{key}' param")))
}

impl Transport for MongoTransport {
    fn mode(&self) -> &'static str {
        "mongodb"
    }

    fn fetch(&self, binding: &Binding, port: &Port, dir: &Path) -> Result<Value, SluiceError> {
        let collection = Self::collection(binding)?;
        let mut docs = Vec::new();
        for entry in collection.find(Document::new()).run()? {
            let doc = entry?;
            docs.push(serde_json::to_value(&doc)?);
        }
        debug!(count = docs.len(), "fetched documents");

        let data = Value::Array(docs);
        match effective_target(binding, port) {
            Target::Memory => Ok(data),
            Target::Filepath => {
                let path = dir.join(fetch_file_name(binding, port));
                std::fs::write(&path, serde_json::to_vec(&data)?)?;
                Ok(Value::String(path.display().to_string()))
            }
        }
    }

    fn push(&self, data: &Value, binding: &mut Binding, _port: &Port) -> Result<(), SluiceError> {
        let collection = Self::collection(binding)?;
        let values = match data {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        let mut docs = Vec::with_capacity(values.len());
        for value in values {
            match mongodb::bson::to_bson(&value)? {
                Bson::Document(doc) => docs.push(doc),
                other => {
                    return Err(SluiceError::Transport(format!(
                        "cannot store non-document value ({other}) in mongodb"
                    )))
                }
            }
        }
        if !docs.is_empty() {
            collection.insert_many(docs).run()?;
        }
        debug!("inserted documents");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collection_binding() -> Binding {
        let mut binding = Binding {
            url: Some("mongodb://localhost:27017".to_string()),
            mode: Some("mongodb".to_string()),
            ..Default::default()
        };
        binding.params.insert("db".into(), "work".into());
        binding.params.insert("collection".into(), "items".into());
        binding
    }

    #[test]
    fn missing_url_is_transport_error() {
        let port = Port::new("docs", "collection", "json");
        let mut binding = collection_binding();
        binding.url = None;
        let err = MongoTransport
            .fetch(&binding, &port, Path::new("/tmp"))
            .unwrap_err();
        assert!(matches!(err, SluiceError::Transport(msg) if msg.contains("no url")));
    }

    #[test]
    fn missing_params_name_the_missing_key() {
        let port = Port::new("docs", "collection", "json");
        for key in ["db", "collection"] {
            let mut binding = collection_binding();
            binding.params.remove(key);
            let err = MongoTransport
                .fetch(&binding, &port, Path::new("/tmp"))
                .unwrap_err();
            assert!(matches!(err, SluiceError::Transport(msg) if msg.contains(key)));
        }
    }

    #[test]
    fn non_document_push_is_rejected_before_any_insert() {
        let port = Port::new("docs", "collection", "json");
        let mut binding = collection_binding();
        let err = MongoTransport
            .push(&json!([1, 2, 3]), &mut binding, &port)
            .unwrap_err();
        assert!(matches!(err, SluiceError::Transport(msg) if msg.contains("non-document")));
    }
}
