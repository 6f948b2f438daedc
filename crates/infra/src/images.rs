//! Image collaborator: ownership and visibility lookups.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fitswap_core::{ImageId, UserId};

use crate::retry::{Classify, ErrorClass};

/// Who owns an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ImageOwner {
    User(UserId),
    /// Catalogue garments uploaded by a vendor; usable by anyone.
    Vendor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: ImageId,
    pub owner: ImageOwner,
    pub visibility: Visibility,
}

impl ImageInfo {
    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.owner == ImageOwner::User(user_id)
    }

    /// A target garment may be public, vendor-owned, or the caller's own.
    pub fn usable_as_target_by(&self, user_id: UserId) -> bool {
        self.visibility == Visibility::Public
            || self.owner == ImageOwner::Vendor
            || self.is_owned_by(user_id)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ImageError {
    #[error("image not found: {0}")]
    NotFound(ImageId),

    #[error("access to image {image} denied for user {user}")]
    Denied { image: ImageId, user: UserId },

    /// The image service could not be reached.
    #[error("image service unavailable: {0}")]
    Unavailable(String),
}

impl Classify for ImageError {
    fn error_class(&self) -> Option<ErrorClass> {
        match self {
            ImageError::Unavailable(_) => Some(ErrorClass::Retryable),
            _ => Some(ErrorClass::Terminal),
        }
    }
}

#[async_trait]
pub trait ImageService: Send + Sync {
    async fn get_image(&self, id: ImageId) -> Result<ImageInfo, ImageError>;

    /// Succeeds when `user_id` may use `id` at all (owner, public, or vendor).
    async fn validate_access(&self, id: ImageId, user_id: UserId) -> Result<(), ImageError> {
        let info = self.get_image(id).await?;
        if info.usable_as_target_by(user_id) {
            Ok(())
        } else {
            Err(ImageError::Denied {
                image: id,
                user: user_id,
            })
        }
    }
}

/// Map-backed image catalogue.
#[derive(Debug, Default)]
pub struct InMemoryImageService {
    images: RwLock<HashMap<ImageId, ImageInfo>>,
}

impl InMemoryImageService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: ImageInfo) {
        if let Ok(mut images) = self.images.write() {
            images.insert(info.id, info);
        }
    }

    /// Register a private image owned by `user_id`, returning its id.
    pub fn add_user_image(&self, user_id: UserId) -> ImageId {
        let id = ImageId::new();
        self.insert(ImageInfo {
            id,
            owner: ImageOwner::User(user_id),
            visibility: Visibility::Private,
        });
        id
    }

    pub fn add_vendor_image(&self) -> ImageId {
        let id = ImageId::new();
        self.insert(ImageInfo {
            id,
            owner: ImageOwner::Vendor,
            visibility: Visibility::Public,
        });
        id
    }
}

#[async_trait]
impl ImageService for InMemoryImageService {
    async fn get_image(&self, id: ImageId) -> Result<ImageInfo, ImageError> {
        let images = self
            .images
            .read()
            .map_err(|_| ImageError::Unavailable("lock poisoned".to_string()))?;
        images.get(&id).cloned().ok_or(ImageError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vendor_and_public_images_are_usable_by_anyone() {
        let images = InMemoryImageService::new();
        let owner = UserId::new();
        let stranger = UserId::new();

        let vendor = images.add_vendor_image();
        let shared = ImageId::new();
        images.insert(ImageInfo {
            id: shared,
            owner: ImageOwner::User(owner),
            visibility: Visibility::Public,
        });

        assert!(images.validate_access(vendor, stranger).await.is_ok());
        assert!(images.validate_access(shared, stranger).await.is_ok());
    }

    #[tokio::test]
    async fn private_images_are_owner_only() {
        let images = InMemoryImageService::new();
        let owner = UserId::new();
        let private = images.add_user_image(owner);

        assert!(images.validate_access(private, owner).await.is_ok());
        assert!(matches!(
            images.validate_access(private, UserId::new()).await,
            Err(ImageError::Denied { .. })
        ));
        assert!(matches!(
            images.get_image(ImageId::new()).await,
            Err(ImageError::NotFound(_))
        ));
    }

    #[test]
    fn only_unavailability_is_retryable() {
        assert_eq!(
            ImageError::Unavailable("timeout".into()).error_class(),
            Some(ErrorClass::Retryable)
        );
        assert_eq!(
            ImageError::NotFound(ImageId::new()).error_class(),
            Some(ErrorClass::Terminal)
        );
    }
}
