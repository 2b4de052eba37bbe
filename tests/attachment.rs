//! Online episode attachment: the decision ladder, centroid maintenance,
//! and user isolation.

mod common;

use common::*;
use engram::episodes::AttachDecision;
use engram::queue::QueueName;
use engram::types::EpisodeId;
use engram::vectors::{VectorClass, VectorStore};

/// Give an episode one founding member so its centroid has a real count.
async fn found_episode(
    h: &Harness,
    user: &str,
    title: &str,
    centroid: Vec<f32>,
) -> EpisodeId {
    let episode = seed_episode(h, user, title, centroid.clone()).await;
    let chunk = seed_chunk(h, user, &format!("founding chunk for {title}"), 0.8, centroid).await;
    let vector = chunk.vector.clone().unwrap();
    h.store
        .attach_chunk_to_episode(chunk.id, episode.id, &vector)
        .await
        .unwrap();
    episode.id
}

#[tokio::test]
async fn primary_attach_links_the_single_close_episode() {
    let h = harness().await;
    let e1 = found_episode(&h, "u1", "axis one", vec![1.0, 0.0, 0.0, 0.0]).await;
    let e2 = found_episode(&h, "u1", "axis two", vec![0.0, 1.0, 0.0, 0.0]).await;

    let v = vec![0.95, 0.05, 0.0, 0.0];
    let chunk = seed_chunk(&h, "u1", "close to axis one", 0.8, v.clone()).await;

    let decision = h.attacher.attach(chunk.id, "u1").await.unwrap();
    assert_eq!(decision, AttachDecision::Attached(e1));

    // Centroid follows the online rule: (1·e1 + v) / 2.
    let episode = h.store.get_episode(e1).await.unwrap().unwrap();
    let expected = [0.975f32, 0.025, 0.0, 0.0];
    for (got, want) in episode.centroid.iter().zip(expected.iter()) {
        assert!((got - want).abs() < 1e-6, "centroid {got} != {want}");
    }
    assert_eq!(h.store.episode_member_count(e1).await.unwrap(), 2);

    // The far episode is untouched and no new episode appeared.
    assert_eq!(h.store.episode_member_count(e2).await.unwrap(), 1);
    assert_eq!(h.store.episodes_for_user("u1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn multi_attach_links_every_qualifying_episode() {
    let h = harness().await;
    let e1 = found_episode(&h, "u1", "axis one", vec![1.0, 0.0, 0.0, 0.0]).await;
    let e2 = found_episode(&h, "u1", "axis two", vec![0.0, 1.0, 0.0, 0.0]).await;

    // Unit vector with cosine ≈ 0.710 to e1 and ≈ 0.703 to e2, both
    // above the 0.70 multi-attach band.
    let a = 0.710f32;
    let b = 0.703f32;
    let z = (1.0 - a * a - b * b).max(0.0).sqrt();
    let v = vec![a, b, z, 0.0];
    let chunk = seed_chunk(&h, "u1", "between both axes", 0.8, v).await;

    let decision = h.attacher.attach(chunk.id, "u1").await.unwrap();
    match decision {
        AttachDecision::MultiAttached(ids) => {
            assert_eq!(ids.len(), 2);
            assert!(ids.contains(&e1));
            assert!(ids.contains(&e2));
        }
        other => panic!("expected multi-attach, got {other:?}"),
    }

    // Two link rows, one per episode; each centroid folded the vector in.
    assert_eq!(h.store.episode_member_count(e1).await.unwrap(), 2);
    assert_eq!(h.store.episode_member_count(e2).await.unwrap(), 2);
}

#[tokio::test]
async fn distant_important_chunk_seeds_a_new_episode() {
    let h = harness().await;
    found_episode(&h, "u1", "axis one", vec![1.0, 0.0, 0.0, 0.0]).await;
    let episode_shadows_before = h.vectors.count(VectorClass::EpisodeEmbedding);

    // Orthogonal to everything: best similarity 0 < 0.60 seed threshold.
    let v = vec![0.0, 0.0, 0.0, 1.0];
    let chunk = seed_chunk(&h, "u1", "a completely new topic", 0.7, v.clone()).await;

    let decision = h.attacher.attach(chunk.id, "u1").await.unwrap();
    let AttachDecision::Seeded(episode_id) = decision else {
        panic!("expected seeding, got {decision:?}");
    };

    let episode = h.store.get_episode(episode_id).await.unwrap().unwrap();
    assert_eq!(episode.centroid, v);
    assert_eq!(episode.title, "A remembered episode");
    assert!(!episode.narrative.is_empty());
    assert_eq!(h.store.episode_member_count(episode_id).await.unwrap(), 1);
    assert_eq!(
        h.vectors.count(VectorClass::EpisodeEmbedding),
        episode_shadows_before + 1
    );
}

#[tokio::test]
async fn first_important_chunk_of_a_user_seeds_without_candidates() {
    let h = harness().await;
    let chunk = seed_chunk(&h, "u1", "first ever memory", 0.8, vec![0.0, 0.0, 1.0, 0.0]).await;
    let decision = h.attacher.attach(chunk.id, "u1").await.unwrap();
    assert!(matches!(decision, AttachDecision::Seeded(_)));
}

#[tokio::test]
async fn distant_unimportant_chunk_is_orphaned_and_triggers_consolidation() {
    let h = harness().await;
    found_episode(&h, "u1", "axis one", vec![1.0, 0.0, 0.0, 0.0]).await;

    let chunk = seed_chunk(&h, "u1", "idle remark", 0.2, vec![0.0, 0.0, 0.0, 1.0]).await;
    let decision = h.attacher.attach(chunk.id, "u1").await.unwrap();
    assert_eq!(decision, AttachDecision::Orphaned);

    // The chunk stays unlinked and a consolidation trigger is queued.
    let orphans = h.store.orphan_chunks("u1").await.unwrap();
    assert!(orphans.iter().any(|c| c.id == chunk.id));
    let stats = h
        .queues
        .stats()
        .into_iter()
        .find(|s| s.name == QueueName::Consolidate)
        .unwrap();
    assert_eq!(stats.queued, 1);
}

#[tokio::test]
async fn force_important_does_not_extend_to_episode_seeding() {
    // The flag bypasses the ingestion gate and nothing more: a
    // low-importance document chunk with no nearby episode stays orphaned
    // instead of seeding.
    let h = harness().await;
    let record = h
        .store
        .insert_raw_record(
            chat_draft("u1", "document excerpt").with_skip_importance_check(true),
        )
        .await
        .unwrap();
    let mut chunks = h
        .store
        .insert_chunks(vec![engram::model::NewChunk {
            raw_record_id: record.id,
            user_id: "u1".into(),
            session_id: "session-1".into(),
            text: "document excerpt".into(),
            index: 0,
            token_count: 1,
            importance_score: 0.1,
            metadata: engram::model::ChunkMetadata {
                content_type: engram::types::ContentType::UploadedDocumentContent,
                source_created_at: record.created_at,
                perspective_owner_id: "u1".into(),
                subject_id: "u1".into(),
                topic_key: None,
                force_important: true,
            },
        }])
        .await
        .unwrap();
    let chunk = chunks.remove(0);
    let v = vec![0.0, 0.0, 0.0, 1.0];
    h.store.set_chunk_vector(chunk.id, &v).await.unwrap();
    h.vectors
        .upsert_batch(
            VectorClass::ChunkEmbedding,
            vec![engram::vectors::VectorObject::chunk(chunk.id, "u1", 0.1, v)],
        )
        .await
        .unwrap();

    let decision = h.attacher.attach(chunk.id, "u1").await.unwrap();
    assert_eq!(decision, AttachDecision::Orphaned);

    // No episode was created; the chunk waits for consolidation instead.
    assert!(h.store.episodes_for_user("u1").await.unwrap().is_empty());
    let orphans = h.store.orphan_chunks("u1").await.unwrap();
    assert!(orphans.iter().any(|c| c.id == chunk.id));
}

#[tokio::test]
async fn missing_vector_is_a_retryable_failure() {
    let h = harness().await;
    let record = h
        .store
        .insert_raw_record(chat_draft("u1", "no shadow yet"))
        .await
        .unwrap();
    let mut chunks = h
        .store
        .insert_chunks(vec![engram::model::NewChunk {
            raw_record_id: record.id,
            user_id: "u1".into(),
            session_id: "session-1".into(),
            text: "no shadow yet".into(),
            index: 0,
            token_count: 1,
            importance_score: 0.8,
            metadata: engram::model::ChunkMetadata {
                content_type: engram::types::ContentType::UserChat,
                source_created_at: record.created_at,
                perspective_owner_id: "u1".into(),
                subject_id: "u1".into(),
                topic_key: None,
                force_important: false,
            },
        }])
        .await
        .unwrap();
    let chunk = chunks.remove(0);

    let err = h.attacher.attach(chunk.id, "u1").await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn linking_is_idempotent_per_pair() {
    let h = harness().await;
    let episode = found_episode(&h, "u1", "axis one", vec![1.0, 0.0, 0.0, 0.0]).await;
    let chunk = seed_chunk(&h, "u1", "again and again", 0.8, vec![0.9, 0.1, 0.0, 0.0]).await;
    let v = chunk.vector.clone().unwrap();

    let first = h
        .store
        .attach_chunk_to_episode(chunk.id, episode, &v)
        .await
        .unwrap();
    assert!(first.inserted);
    let second = h
        .store
        .attach_chunk_to_episode(chunk.id, episode, &v)
        .await
        .unwrap();
    assert!(!second.inserted);

    // The duplicate link changed nothing.
    assert_eq!(second.member_count, first.member_count);
    assert_eq!(second.centroid, first.centroid);
}

#[tokio::test]
async fn centroid_converges_to_the_mean_in_any_link_order() {
    let h = harness().await;
    let members = [
        vec![1.0f32, 0.0, 0.0, 0.0],
        vec![0.0, 1.0, 0.0, 0.0],
        vec![0.0, 0.0, 1.0, 0.0],
    ];

    let mut finals: Vec<Vec<f32>> = Vec::new();
    for (user, order) in [("ua", [0usize, 1, 2]), ("ub", [2, 0, 1])] {
        let episode = seed_episode(&h, user, "ordering", vec![0.0; 4]).await;
        for &i in &order {
            let chunk = seed_chunk(&h, user, &format!("member {i}"), 0.8, members[i].clone()).await;
            h.store
                .attach_chunk_to_episode(chunk.id, episode.id, &members[i])
                .await
                .unwrap();
        }
        finals.push(h.store.get_episode(episode.id).await.unwrap().unwrap().centroid);
    }

    let expected = [1.0f32 / 3.0; 3];
    for centroid in &finals {
        for (got, want) in centroid.iter().take(3).zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6);
        }
    }
    assert_eq!(finals[0], finals[1]);
}

#[tokio::test]
async fn cross_user_links_are_refused() {
    let h = harness().await;
    let episode = seed_episode(&h, "u1", "theirs", vec![1.0, 0.0, 0.0, 0.0]).await;
    let chunk = seed_chunk(&h, "u2", "mine", 0.8, vec![1.0, 0.0, 0.0, 0.0]).await;

    let err = h
        .store
        .attach_chunk_to_episode(chunk.id, episode.id, &[1.0, 0.0, 0.0, 0.0])
        .await
        .unwrap_err();
    assert!(matches!(err, engram::model::StoreError::UserMismatch { .. }));
}
