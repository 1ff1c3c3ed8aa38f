use ulid::Ulid;

use crate::model::*;
use crate::store::{BookingStore, StoreError};

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// First scheduled booking overlapping `span`, other than `exclude`.
/// Touching boundaries are not a conflict.
pub async fn find_conflict(
    bookings: &dyn BookingStore,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<Option<Ulid>, StoreError> {
    let filter = BookingFilter {
        status: Some(BookingStatus::Scheduled),
        overlapping: Some(*span),
        exclude_id: exclude,
        ..Default::default()
    };
    let hits = bookings.query(&filter, Default::default()).await?;
    Ok(hits.first().map(|b| b.id))
}

pub async fn has_conflict(
    bookings: &dyn BookingStore,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<bool, StoreError> {
    Ok(find_conflict(bookings, span, exclude).await?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("kairos_test_conflict");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn seed(store: &MemoryStore, start: Ms, end: Ms) -> Booking {
        store
            .insert(
                NewBooking {
                    title: "Existing".into(),
                    description: None,
                    span: Span::new(start, end),
                    location: None,
                    meeting_link: None,
                    max_attendees: 10,
                    created_by: Ulid::new(),
                },
                0,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn empty_store_has_no_conflict() {
        let store = MemoryStore::open(test_wal_path("empty.wal")).unwrap();
        assert!(!has_conflict(&store, &Span::new(100, 200), None).await.unwrap());
    }

    #[tokio::test]
    async fn overlap_is_conflict_and_self_is_excluded() {
        let store = MemoryStore::open(test_wal_path("overlap.wal")).unwrap();
        let b = seed(&store, 1000, 2000).await;

        for (start, end) in [(1500, 2500), (500, 1001), (1999, 3000), (1200, 1300), (0, 5000)] {
            let span = Span::new(start, end);
            assert_eq!(find_conflict(&store, &span, None).await.unwrap(), Some(b.id));
            assert!(!has_conflict(&store, &span, Some(b.id)).await.unwrap());
        }
    }

    #[tokio::test]
    async fn back_to_back_is_not_conflict() {
        let store = MemoryStore::open(test_wal_path("touching.wal")).unwrap();
        seed(&store, 1000, 2000).await;
        assert!(!has_conflict(&store, &Span::new(2000, 3000), None).await.unwrap());
        assert!(!has_conflict(&store, &Span::new(0, 1000), None).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_bookings_do_not_conflict() {
        let store = MemoryStore::open(test_wal_path("cancelled.wal")).unwrap();
        let b = seed(&store, 1000, 2000).await;
        store
            .update(b.id, BookingPatch::status(BookingStatus::Cancelled), 1)
            .await
            .unwrap();
        assert!(!has_conflict(&store, &Span::new(1000, 2000), None).await.unwrap());
    }
}
