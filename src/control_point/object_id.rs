use std::str::FromStr;

/// Object id of an aggregated content tree: `0` is the synthetic root, each
/// remote media server hangs under it by uuid, and everything deeper is the
/// remote server's own object id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectIdPath {
    Root,
    Device(uuid::Uuid),
    Object(uuid::Uuid, String),
}

pub fn format_object_id(path: &ObjectIdPath) -> String {
    match path {
        ObjectIdPath::Root => "0".to_string(),
        ObjectIdPath::Device(uuid) => format!("0/{uuid}"),
        ObjectIdPath::Object(uuid, object_id) => format!("0/{uuid}/{object_id}"),
    }
}

pub fn split_object_id(raw: &str) -> Option<ObjectIdPath> {
    let mut parts = raw.splitn(3, '/');
    if parts.next() != Some("0") {
        return None;
    }
    let Some(device) = parts.next() else {
        return Some(ObjectIdPath::Root);
    };
    let uuid = uuid::Uuid::from_str(device).ok()?;
    match parts.next() {
        Some(object_id) if !object_id.is_empty() => {
            Some(ObjectIdPath::Object(uuid, object_id.to_string()))
        }
        Some(_) => None,
        None => Some(ObjectIdPath::Device(uuid)),
    }
}

#[cfg(test)]
mod tests {
    use super::{format_object_id, split_object_id, ObjectIdPath};

    #[test]
    fn roundtrip() {
        let samples = [
            "0",
            "0/8a4d7e34-1a30-4b23-a829-fcc511b2a9d2",
            "0/8a4d7e34-1a30-4b23-a829-fcc511b2a9d2/64",
            "0/8a4d7e34-1a30-4b23-a829-fcc511b2a9d2/music/albums/12",
        ];
        for sample in samples {
            let path = split_object_id(sample).unwrap();
            assert_eq!(format_object_id(&path), sample);
        }
    }

    #[test]
    fn rejects_foreign_roots() {
        assert_eq!(split_object_id("1"), None);
        assert_eq!(split_object_id("0/not-a-uuid"), None);
        assert_eq!(split_object_id(""), None);
    }
}
