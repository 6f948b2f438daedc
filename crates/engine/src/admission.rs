//! Admission: the gate in front of record creation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fitswap_conversions::NewConversion;
use fitswap_core::{ImageId, UserId};
use fitswap_infra::{
    CreatedConversion, ImageError, ImageInfo, ImageService, RateLimiter, RetryError,
    RetryExecutor,
};

use crate::error::{ConversionError, ConversionResult};
use crate::quota::QuotaLedger;

const IMAGES_POLICY: &str = "images";

/// A user's request to composite `target_image_id` onto `source_image_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub source_image_id: ImageId,
    pub target_image_id: ImageId,
    #[serde(default)]
    pub style: Option<String>,
}

/// Composes the rate limit, image checks, request validation and quota into
/// one admit/reject decision.
///
/// Gates run in order and the first failure wins:
/// 1. rate limit
/// 2. source and target images resolve and are usable by the caller
/// 3. request shape (distinct images, style label)
/// 4. quota reservation, atomic with record creation
pub struct AdmissionController {
    rate_limiter: Arc<dyn RateLimiter>,
    images: Arc<dyn ImageService>,
    ledger: QuotaLedger,
    retry: RetryExecutor,
}

impl AdmissionController {
    pub fn new(
        rate_limiter: Arc<dyn RateLimiter>,
        images: Arc<dyn ImageService>,
        ledger: QuotaLedger,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            rate_limiter,
            images,
            ledger,
            retry,
        }
    }

    pub async fn admit(
        &self,
        user_id: UserId,
        request: AdmissionRequest,
        cancel: &CancellationToken,
    ) -> ConversionResult<CreatedConversion> {
        self.rate_limiter.check(user_id)?;

        // An image that exists but may not be used is AccessDenied, not
        // InvalidImage; InvalidImage is reserved for ids that do not resolve.
        let source = self.resolve_image(request.source_image_id, cancel).await?;
        if !source.is_owned_by(user_id) {
            return Err(ConversionError::AccessDenied(format!(
                "source image {} does not belong to the caller",
                source.id
            )));
        }
        let target = self.resolve_image(request.target_image_id, cancel).await?;
        if !target.usable_as_target_by(user_id) {
            return Err(ConversionError::AccessDenied(format!(
                "target image {} is private",
                target.id
            )));
        }

        let new = NewConversion::new(
            user_id,
            request.source_image_id,
            request.target_image_id,
            request.style,
        );
        new.validate()?;

        let created = self.ledger.reserve_and_create(new).await?;

        // Counted only once admitted; rejected requests do not eat the window.
        self.rate_limiter.record(user_id);

        info!(
            user_id = %user_id,
            conversion_id = %created.record.id,
            charged = ?created.charged,
            "conversion admitted"
        );
        Ok(created)
    }

    async fn resolve_image(
        &self,
        id: ImageId,
        cancel: &CancellationToken,
    ) -> ConversionResult<ImageInfo> {
        self.retry
            .execute(IMAGES_POLICY, cancel, |_| self.images.get_image(id))
            .await
            .map_err(|e| {
                debug!(image_id = %id, error = %e, "image lookup failed");
                image_lookup_error(e)
            })
    }
}

fn image_lookup_error(error: RetryError<ImageError>) -> ConversionError {
    let attempts = error.attempts();
    match error.into_last_error() {
        None => ConversionError::Cancelled,
        Some(ImageError::NotFound(id)) => {
            ConversionError::InvalidImage(format!("image {id} does not exist"))
        }
        Some(ImageError::Denied { image, .. }) => {
            ConversionError::AccessDenied(format!("image {image} is not accessible"))
        }
        Some(other @ ImageError::Unavailable(_)) => ConversionError::RetryExhausted {
            attempts,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fitswap_conversions::ConversionStatus;
    use fitswap_infra::{
        ConversionStore, InMemoryConversionStore, InMemoryImageService, QuotaDefaults,
        RetryPolicies, RetryPolicy, SlidingWindowRateLimiter,
    };

    struct Fixture {
        controller: AdmissionController,
        images: Arc<InMemoryImageService>,
        store: Arc<InMemoryConversionStore>,
    }

    fn fixture(rate_limit: u32, quota: u32) -> Fixture {
        let store = InMemoryConversionStore::arc(QuotaDefaults {
            plan: "free".into(),
            monthly_limit: quota,
        });
        let images = Arc::new(InMemoryImageService::new());
        let controller = AdmissionController::new(
            Arc::new(SlidingWindowRateLimiter::new(rate_limit, Duration::from_secs(60))),
            images.clone(),
            QuotaLedger::new(store.clone()),
            RetryExecutor::new(RetryPolicies::new(RetryPolicy::no_retry())),
        );
        Fixture {
            controller,
            images,
            store,
        }
    }

    fn request(source: ImageId, target: ImageId) -> AdmissionRequest {
        AdmissionRequest {
            source_image_id: source,
            target_image_id: target,
            style: None,
        }
    }

    #[tokio::test]
    async fn admits_owned_source_and_vendor_target() {
        let f = fixture(10, 3);
        let user = UserId::new();
        let source = f.images.add_user_image(user);
        let target = f.images.add_vendor_image();

        let created = f
            .controller
            .admit(user, request(source, target), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(created.record.status, ConversionStatus::Pending);
        assert_eq!(created.quota.remaining_free, 2);
    }

    #[tokio::test]
    async fn rate_limit_is_checked_first() {
        let f = fixture(1, 10);
        let user = UserId::new();
        let source = f.images.add_user_image(user);
        let target = f.images.add_vendor_image();
        let cancel = CancellationToken::new();

        f.controller.admit(user, request(source, target), &cancel).await.unwrap();
        // Unknown images would also fail; the limiter must win.
        let err = f
            .controller
            .admit(user, request(ImageId::new(), ImageId::new()), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::RateLimited { limit: 1, .. }));
    }

    #[tokio::test]
    async fn unknown_and_foreign_images_are_rejected() {
        let f = fixture(10, 10);
        let user = UserId::new();
        let other = UserId::new();
        let cancel = CancellationToken::new();
        let mine = f.images.add_user_image(user);
        let theirs = f.images.add_user_image(other);

        let err = f
            .controller
            .admit(user, request(ImageId::new(), mine), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_image");

        let err = f
            .controller
            .admit(user, request(theirs, mine), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "access_denied");

        let err = f
            .controller
            .admit(user, request(mine, theirs), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "access_denied");

        assert_eq!(f.store.check_user_quota(user).await.unwrap().free_used, 0);
    }

    #[tokio::test]
    async fn self_composite_is_rejected_before_any_charge() {
        let f = fixture(10, 1);
        let user = UserId::new();
        let image = f.images.add_user_image(user);

        let err = f
            .controller
            .admit(user, request(image, image), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::InvalidRequest(_)));
        assert_eq!(f.store.check_user_quota(user).await.unwrap().remaining_free, 1);
    }

    #[tokio::test]
    async fn cancelled_before_lookup_creates_nothing() {
        let f = fixture(10, 1);
        let user = UserId::new();
        let source = f.images.add_user_image(user);
        let target = f.images.add_vendor_image();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f
            .controller
            .admit(user, request(source, target), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::Cancelled));
        assert_eq!(f.store.check_user_quota(user).await.unwrap().remaining_free, 1);
    }
}
