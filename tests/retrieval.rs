//! Multi-stage retrieval: stage blending, floors, dedup, ranking, and
//! strict user scoping.

mod common;

use common::*;
use engram::retrieval::{MemoryKind, RetrieveOptions};
use engram::vectors::{VectorClass, VectorObject, VectorStore};
use uuid::Uuid;

const QUERY: &str = "what are we planning";

/// Pin the query embedding to a known direction.
fn pin_query(h: &Harness, direction: Vec<f32>) {
    h.llm.set_embedding(QUERY, direction);
}

#[tokio::test]
async fn episode_hits_bring_their_chunks_along() {
    let h = harness().await;
    pin_query(&h, vec![1.0, 0.0, 0.0, 0.0]);

    let episode = seed_episode(&h, "u1", "lisbon planning", vec![1.0, 0.0, 0.0, 0.0]).await;
    // The chunk itself sits below the direct-hit certainty floor
    // (cos 0.5 < 0.65), so it can only surface through its episode.
    let chunk = seed_chunk(&h, "u1", "we booked flights", 0.8, vec![0.5, 0.866, 0.0, 0.0]).await;
    let v = chunk.vector.clone().unwrap();
    h.store
        .attach_chunk_to_episode(chunk.id, episode.id, &v)
        .await
        .unwrap();

    let results = h
        .retriever
        .retrieve("u1", QUERY, &RetrieveOptions::default())
        .await
        .unwrap();

    let episode_hit = results
        .iter()
        .find(|r| r.kind == MemoryKind::Episode)
        .expect("episode in results");
    assert_eq!(episode_hit.id, episode.id);
    assert_eq!(episode_hit.title.as_deref(), Some("lisbon planning"));
    assert!(!episode_hit.content.is_empty());

    let chunk_hit = results
        .iter()
        .find(|r| r.kind == MemoryKind::Chunk && r.id == chunk.id)
        .expect("linked chunk in results");
    // Linked chunks inherit 0.9 × the episode certainty.
    assert!((chunk_hit.similarity - episode_hit.similarity * 0.9).abs() < 1e-9);
    assert_eq!(chunk_hit.episode_id, Some(episode.id));
    assert_eq!(chunk_hit.episode_title.as_deref(), Some("lisbon planning"));
}

#[tokio::test]
async fn direct_chunk_stage_respects_the_importance_floor() {
    let h = harness().await;
    pin_query(&h, vec![1.0, 0.0, 0.0, 0.0]);

    // No episodes at all; stage 2 must fill the result.
    let weighty = seed_chunk(&h, "u1", "important fact", 0.8, vec![0.99, 0.01, 0.0, 0.0]).await;
    seed_chunk(&h, "u1", "trivia", 0.1, vec![0.98, 0.02, 0.0, 0.0]).await;

    let results = h
        .retriever
        .retrieve("u1", QUERY, &RetrieveOptions::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, weighty.id);
    assert_eq!(results[0].kind, MemoryKind::Chunk);
    assert!(results[0].episode_id.is_none());
}

#[tokio::test]
async fn thoughts_surface_at_a_lower_certainty_floor() {
    let h = harness().await;
    pin_query(&h, vec![1.0, 0.0, 0.0, 0.0]);

    let thought = h
        .store
        .insert_thought(engram::model::NewThought {
            user_id: "u1".into(),
            name: "Planning ahead".into(),
            description: "The user likes to plan trips well in advance.".into(),
            vector: vec![0.8, 0.6, 0.0, 0.0],
            importance: 0.7,
        })
        .await
        .unwrap();
    h.vectors
        .upsert_batch(
            VectorClass::ThoughtEmbedding,
            vec![VectorObject::thought(
                thought.id,
                "u1",
                0.7,
                vec![0.8, 0.6, 0.0, 0.0],
            )],
        )
        .await
        .unwrap();

    // cos(query, thought) = 0.8: above 0.75 × 0.65 but below nothing else.
    let results = h
        .retriever
        .retrieve("u1", QUERY, &RetrieveOptions::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].kind, MemoryKind::Thought);
    assert_eq!(results[0].title.as_deref(), Some("Planning ahead"));
}

#[tokio::test]
async fn duplicate_entities_keep_their_best_similarity() {
    let h = harness().await;
    pin_query(&h, vec![1.0, 0.0, 0.0, 0.0]);

    let episode = seed_episode(&h, "u1", "planning", vec![1.0, 0.0, 0.0, 0.0]).await;
    // The chunk is both linked to the episode and a strong direct hit.
    let chunk = seed_chunk(&h, "u1", "booked the flights", 0.8, vec![1.0, 0.0, 0.0, 0.0]).await;
    let v = chunk.vector.clone().unwrap();
    h.store
        .attach_chunk_to_episode(chunk.id, episode.id, &v)
        .await
        .unwrap();

    let results = h
        .retriever
        .retrieve(
            "u1",
            QUERY,
            &RetrieveOptions {
                limit: Some(10),
                ..RetrieveOptions::default()
            },
        )
        .await
        .unwrap();

    let chunk_hits: Vec<_> = results.iter().filter(|r| r.id == chunk.id).collect();
    assert_eq!(chunk_hits.len(), 1);
    // The direct hit (cos 1.0) beats the inherited 0.9 × episode score.
    assert!(chunk_hits[0].similarity > 0.95);
}

#[tokio::test]
async fn results_are_ranked_and_truncated() {
    let h = harness().await;
    pin_query(&h, vec![1.0, 0.0, 0.0, 0.0]);

    for i in 0..8 {
        let wobble = 0.02 * (i as f32 + 1.0);
        seed_chunk(
            &h,
            "u1",
            &format!("fact {i}"),
            0.8,
            vec![1.0 - wobble, wobble, 0.0, 0.0],
        )
        .await;
    }

    let results = h
        .retriever
        .retrieve(
            "u1",
            QUERY,
            &RetrieveOptions {
                limit: Some(3),
                ..RetrieveOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    for pair in results.windows(2) {
        assert!(pair[0].similarity >= pair[1].similarity);
    }
}

#[tokio::test]
async fn retrieval_never_crosses_users() {
    let h = harness().await;
    pin_query(&h, vec![1.0, 0.0, 0.0, 0.0]);

    let episode = seed_episode(&h, "u1", "u1 episode", vec![1.0, 0.0, 0.0, 0.0]).await;
    let chunk = seed_chunk(&h, "u1", "u1 chunk", 0.8, vec![1.0, 0.0, 0.0, 0.0]).await;
    let v = chunk.vector.clone().unwrap();
    h.store
        .attach_chunk_to_episode(chunk.id, episode.id, &v)
        .await
        .unwrap();

    let results = h
        .retriever
        .retrieve("u2", QUERY, &RetrieveOptions::default())
        .await
        .unwrap();
    assert!(results.is_empty());

    let own = h
        .retriever
        .retrieve("u1", QUERY, &RetrieveOptions::default())
        .await
        .unwrap();
    assert!(!own.is_empty());
}

#[tokio::test]
async fn orphan_shadows_are_skipped_not_fatal() {
    let h = harness().await;
    pin_query(&h, vec![1.0, 0.0, 0.0, 0.0]);

    // A shadow pointing at a row that no longer exists.
    let ghost = Uuid::new_v4();
    h.vectors
        .upsert_batch(
            VectorClass::EpisodeEmbedding,
            vec![VectorObject::episode(ghost, "u1", vec![1.0, 0.0, 0.0, 0.0])],
        )
        .await
        .unwrap();

    let results = h
        .retriever
        .retrieve("u1", QUERY, &RetrieveOptions::default())
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn stage_toggles_disable_their_stages() {
    let h = harness().await;
    pin_query(&h, vec![1.0, 0.0, 0.0, 0.0]);

    let episode = seed_episode(&h, "u1", "planning", vec![1.0, 0.0, 0.0, 0.0]).await;
    let chunk = seed_chunk(&h, "u1", "direct hit", 0.8, vec![1.0, 0.0, 0.0, 0.0]).await;

    let no_episodes = h
        .retriever
        .retrieve(
            "u1",
            QUERY,
            &RetrieveOptions {
                include_episodes: false,
                ..RetrieveOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(no_episodes.iter().all(|r| r.id != episode.id));
    assert!(no_episodes.iter().any(|r| r.id == chunk.id));

    let no_chunks = h
        .retriever
        .retrieve(
            "u1",
            QUERY,
            &RetrieveOptions {
                include_chunks: false,
                ..RetrieveOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(no_chunks.iter().any(|r| r.id == episode.id));
    assert!(no_chunks.iter().all(|r| r.id != chunk.id));
}

#[tokio::test]
async fn blank_queries_return_nothing() {
    let h = harness().await;
    let results = h
        .retriever
        .retrieve("u1", "   ", &RetrieveOptions::default())
        .await
        .unwrap();
    assert!(results.is_empty());
    assert_eq!(h.llm.embed_calls(), 0);
}
