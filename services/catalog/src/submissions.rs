//! Submission model: typed change proposals and their validation.
//!
//! The payload column is schemaless JSON; [`SubmissionPayload`] is the typed
//! view used both when a submission is created and when it is applied.

use crate::catalog_store::NewCafe;
use crate::error::{AppError, AppResult};
use crate::photo_keys::{self, PhotoKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const MAX_DESCRIPTION_CHARS: usize = 2000;
pub const MAX_AMENITY_CHARS: usize = 50;

macro_rules! string_enum {
    ($name:ident, $what:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(AppError::invalid(format!(concat!("unknown ", $what, ": {}"), other))),
                }
            }
        }
    };
}

string_enum!(EntityType, "entity_type" {
    Cafe => "cafe",
    CafeDescription => "cafe_description",
    CafePhoto => "cafe_photo",
    MenuPhoto => "menu_photo",
    Review => "review",
});

string_enum!(ActionType, "action_type" {
    Create => "create",
    Update => "update",
    Delete => "delete",
});

string_enum!(SubmissionStatus, "status" {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    NeedsChanges => "needs_changes",
    Cancelled => "cancelled",
});

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubmissionStatus::Pending)
    }
}

/// A transition out of `pending`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
    RequestChanges,
    Cancel,
}

impl Decision {
    /// Status after the decision; also the moderation event type
    pub fn status(&self) -> SubmissionStatus {
        match self {
            Decision::Approve => SubmissionStatus::Approved,
            Decision::Reject => SubmissionStatus::Rejected,
            Decision::RequestChanges => SubmissionStatus::NeedsChanges,
            Decision::Cancel => SubmissionStatus::Cancelled,
        }
    }

    pub fn requires_comment(&self) -> bool {
        matches!(self, Decision::Reject | Decision::RequestChanges)
    }
}

/// Stored submission
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub id: Uuid,
    pub author_user_id: Uuid,
    pub entity_type: EntityType,
    pub action_type: ActionType,
    pub target_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub status: SubmissionStatus,
    pub moderator_id: Option<Uuid>,
    pub moderator_comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    /// Display name, email or id of the author; moderation listings only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CafeCreatePayload {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub photo_object_keys: Vec<String>,
    #[serde(default)]
    pub menu_photo_object_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionPayload {
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoBatchPayload {
    #[serde(default)]
    pub object_keys: Vec<String>,
}

/// Typed payload, one variant per supported (entity_type, action_type)
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionPayload {
    CafeCreate(CafeCreatePayload),
    DescriptionUpdate(DescriptionPayload),
    CafePhotos(PhotoBatchPayload),
    MenuPhotos(PhotoBatchPayload),
}

impl SubmissionPayload {
    pub fn entity_type(&self) -> EntityType {
        match self {
            SubmissionPayload::CafeCreate(_) => EntityType::Cafe,
            SubmissionPayload::DescriptionUpdate(_) => EntityType::CafeDescription,
            SubmissionPayload::CafePhotos(_) => EntityType::CafePhoto,
            SubmissionPayload::MenuPhotos(_) => EntityType::MenuPhoto,
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            SubmissionPayload::CafeCreate(_)
            | SubmissionPayload::CafePhotos(_)
            | SubmissionPayload::MenuPhotos(_) => ActionType::Create,
            SubmissionPayload::DescriptionUpdate(_) => ActionType::Update,
        }
    }

    /// Everything except cafe creation addresses an existing cafe
    pub fn requires_target(&self) -> bool {
        !matches!(self, SubmissionPayload::CafeCreate(_))
    }

    /// Typed view of a stored payload
    pub fn decode(
        entity_type: EntityType,
        action_type: ActionType,
        payload: &serde_json::Value,
    ) -> AppResult<Self> {
        fn parse<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> AppResult<T> {
            serde_json::from_value(value.clone())
                .map_err(|e| AppError::invalid(format!("invalid payload: {e}")))
        }

        match (entity_type, action_type) {
            (EntityType::Cafe, ActionType::Create) => parse(payload).map(Self::CafeCreate),
            (EntityType::CafeDescription, ActionType::Update) => {
                parse(payload).map(Self::DescriptionUpdate)
            }
            (EntityType::CafePhoto, ActionType::Create) => parse(payload).map(Self::CafePhotos),
            (EntityType::MenuPhoto, ActionType::Create) => parse(payload).map(Self::MenuPhotos),
            (entity, action) => Err(AppError::Unsupported(format!(
                "{entity}/{action} submissions cannot be applied"
            ))),
        }
    }

    pub fn to_value(&self) -> AppResult<serde_json::Value> {
        let value = match self {
            SubmissionPayload::CafeCreate(p) => serde_json::to_value(p),
            SubmissionPayload::DescriptionUpdate(p) => serde_json::to_value(p),
            SubmissionPayload::CafePhotos(p) | SubmissionPayload::MenuPhotos(p) => {
                serde_json::to_value(p)
            }
        };
        value.map_err(|e| AppError::internal(format!("payload encode: {e}")))
    }

    /// Validate and canonicalize for `author`
    pub fn normalized(self, author: Uuid) -> AppResult<Self> {
        Ok(match self {
            SubmissionPayload::CafeCreate(p) => SubmissionPayload::CafeCreate(p.normalized(author)?),
            SubmissionPayload::DescriptionUpdate(p) => {
                SubmissionPayload::DescriptionUpdate(DescriptionPayload {
                    description: validate_description(&p.description)?,
                })
            }
            SubmissionPayload::CafePhotos(p) => SubmissionPayload::CafePhotos(p.normalized(author)?),
            SubmissionPayload::MenuPhotos(p) => SubmissionPayload::MenuPhotos(p.normalized(author)?),
        })
    }

    /// Photo keys in insertion order, tagged with the gallery they go to
    pub fn photo_keys(&self) -> Vec<(PhotoKind, &str)> {
        match self {
            SubmissionPayload::CafeCreate(p) => p
                .photo_object_keys
                .iter()
                .map(|k| (PhotoKind::Cafe, k.as_str()))
                .chain(
                    p.menu_photo_object_keys
                        .iter()
                        .map(|k| (PhotoKind::Menu, k.as_str())),
                )
                .collect(),
            SubmissionPayload::CafePhotos(p) => {
                p.object_keys.iter().map(|k| (PhotoKind::Cafe, k.as_str())).collect()
            }
            SubmissionPayload::MenuPhotos(p) => {
                p.object_keys.iter().map(|k| (PhotoKind::Menu, k.as_str())).collect()
            }
            SubmissionPayload::DescriptionUpdate(_) => Vec::new(),
        }
    }
}

impl CafeCreatePayload {
    pub fn normalized(self, author: Uuid) -> AppResult<Self> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::invalid("name is required"));
        }
        let address = self.address.trim().to_string();
        if address.is_empty() {
            return Err(AppError::invalid("address is required"));
        }
        validate_coordinates(self.latitude, self.longitude)?;

        let description = match self.description.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(text) => Some(validate_description(text)?),
        };

        Ok(Self {
            name,
            address,
            description,
            latitude: self.latitude,
            longitude: self.longitude,
            amenities: normalize_amenities(&self.amenities)?,
            photo_object_keys: normalize_object_keys(author, &self.photo_object_keys)?,
            menu_photo_object_keys: normalize_object_keys(author, &self.menu_photo_object_keys)?,
        })
    }

    pub fn new_cafe(&self) -> NewCafe {
        NewCafe {
            name: self.name.clone(),
            address: self.address.clone(),
            description: self.description.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            amenities: self.amenities.clone(),
        }
    }
}

impl PhotoBatchPayload {
    pub fn normalized(self, author: Uuid) -> AppResult<Self> {
        let object_keys = normalize_object_keys(author, &self.object_keys)?;
        if object_keys.is_empty() {
            return Err(AppError::invalid("at least one object_key is required"));
        }
        Ok(Self { object_keys })
    }
}

/// Trimmed description of 1..=2000 code points
pub fn validate_description(raw: &str) -> AppResult<String> {
    let description = raw.trim();
    if description.is_empty() {
        return Err(AppError::invalid("description is required"));
    }
    if description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(AppError::invalid_with(
            "description is too long",
            json!({ "max_chars": MAX_DESCRIPTION_CHARS }),
        ));
    }
    Ok(description.to_string())
}

pub fn validate_coordinates(latitude: f64, longitude: f64) -> AppResult<()> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(AppError::invalid("latitude must be within [-90, 90]"));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(AppError::invalid("longitude must be within [-180, 180]"));
    }
    Ok(())
}

/// Trim, lowercase and dedupe tags, keeping first-seen order
pub fn normalize_amenities(raw: &[String]) -> AppResult<Vec<String>> {
    let mut seen = HashSet::new();
    let mut amenities = Vec::new();
    for tag in raw {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            continue;
        }
        if tag.chars().count() > MAX_AMENITY_CHARS {
            return Err(AppError::invalid_with(
                "amenity is too long",
                json!({ "max_chars": MAX_AMENITY_CHARS }),
            ));
        }
        if seen.insert(tag.clone()) {
            amenities.push(tag);
        }
    }
    Ok(amenities)
}

/// Trim leading slashes, drop empties and duplicates, and require every key to
/// sit under the author's pending prefix
pub fn normalize_object_keys(author: Uuid, raw: &[String]) -> AppResult<Vec<String>> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for key in raw {
        let key = photo_keys::trim_key(key);
        if key.is_empty() {
            continue;
        }
        if !photo_keys::is_under_pending_prefix(key, author) {
            return Err(AppError::invalid_with(
                "invalid object_key",
                json!({ "object_key": key }),
            ));
        }
        if seen.insert(key) {
            keys.push(key.to_string());
        }
    }
    Ok(keys)
}

/// Position and cover flag for the `index`-th photo inserted into a cafe that
/// had `count_before` photos when the batch started
pub fn photo_slot(kind: PhotoKind, count_before: i64, index: usize) -> (i32, bool) {
    let position = i32::try_from(count_before + 1 + index as i64).unwrap_or(i32::MAX);
    let is_cover = kind == PhotoKind::Cafe && count_before == 0 && index == 0;
    (position, is_cover)
}
