use async_trait::async_trait;
use ulid::Ulid;

use crate::model::MeetingRoom;

/// Seam to the meeting-room infrastructure. Called once per booking, inside
/// the reservation's critical section, so implementations should be fast and
/// must not retry forever.
#[async_trait]
pub trait RoomProvider: Send + Sync {
    async fn provision(&self, lesson_id: Ulid) -> Result<MeetingRoom, String>;
}

/// Deterministic in-process provider: derives an opaque room reference from
/// the lesson id. Good enough for tests and single-node deployments; real
/// deployments plug a video-conferencing client in here.
pub struct LocalRoomProvider {
    pub base_url: String,
}

impl Default for LocalRoomProvider {
    fn default() -> Self {
        Self {
            base_url: "https://meet.example.com".into(),
        }
    }
}

#[async_trait]
impl RoomProvider for LocalRoomProvider {
    async fn provision(&self, lesson_id: Ulid) -> Result<MeetingRoom, String> {
        let reference = format!("room-{}", lesson_id.to_string().to_lowercase());
        let url = format!("{}/{reference}", self.base_url);
        Ok(MeetingRoom { reference, url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_provider_is_deterministic() {
        let provider = LocalRoomProvider::default();
        let id = Ulid::new();
        let a = provider.provision(id).await.unwrap();
        let b = provider.provision(id).await.unwrap();
        assert_eq!(a, b);
        assert!(a.url.ends_with(&a.reference));
    }
}
