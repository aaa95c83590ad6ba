//! Engine catalog rows
//!
//! Engines are seeded directly into the table (no management API); the
//! orchestrator only ever loads them.

use chrono::{DateTime, Utc};
use folio_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::EngineGraph;

/// A stored engine: a named, validated node/edge graph
#[derive(Debug, Clone)]
pub struct Engine {
    pub engine_id: Uuid,
    pub name: String,
    pub graph: EngineGraph,
    pub created_at: DateTime<Utc>,
}

/// Save an engine (insert or replace its graph)
pub async fn save_engine(pool: &SqlitePool, engine: &Engine) -> Result<()> {
    engine.graph.validate()?;

    let graph = serde_json::to_string(&engine.graph)
        .map_err(|e| folio_common::Error::Internal(format!("Failed to serialize graph: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO engines (engine_id, name, graph, created_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(engine_id) DO UPDATE SET
            name = excluded.name,
            graph = excluded.graph
        "#,
    )
    .bind(engine.engine_id.to_string())
    .bind(&engine.name)
    .bind(&graph)
    .bind(engine.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Load an engine by id
pub async fn load_engine(pool: &SqlitePool, engine_id: Uuid) -> Result<Option<Engine>> {
    let row = sqlx::query(
        "SELECT engine_id, name, graph, created_at FROM engines WHERE engine_id = ?",
    )
    .bind(engine_id.to_string())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let graph: String = row.get("graph");
            let graph: EngineGraph = serde_json::from_str(&graph).map_err(|e| {
                folio_common::Error::Internal(format!("Failed to deserialize graph: {}", e))
            })?;

            let created_at: String = row.get("created_at");
            let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| {
                    folio_common::Error::Internal(format!("Failed to parse created_at: {}", e))
                })?
                .with_timezone(&chrono::Utc);

            Ok(Some(Engine {
                engine_id,
                name: row.get("name"),
                graph,
                created_at,
            }))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GraphEdge, GraphNode, NodeKind};

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        crate::db::init_tables(&pool).await.unwrap();
        pool
    }

    fn linear_engine() -> Engine {
        Engine {
            engine_id: Uuid::new_v4(),
            name: "Short novel".to_string(),
            graph: EngineGraph {
                nodes: vec![
                    GraphNode {
                        id: "input".to_string(),
                        label: "Premise".to_string(),
                        kind: NodeKind::Input,
                        prompt: None,
                        chapters: None,
                    },
                    GraphNode {
                        id: "writer".to_string(),
                        label: "Writer".to_string(),
                        kind: NodeKind::MultiChapterGeneration,
                        prompt: Some("Write the next chapter.".to_string()),
                        chapters: Some(5),
                    },
                    GraphNode {
                        id: "output".to_string(),
                        label: "Book".to_string(),
                        kind: NodeKind::Output,
                        prompt: None,
                        chapters: None,
                    },
                ],
                edges: vec![
                    GraphEdge {
                        source: "input".to_string(),
                        target: "writer".to_string(),
                    },
                    GraphEdge {
                        source: "writer".to_string(),
                        target: "output".to_string(),
                    },
                ],
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load_engine() {
        let pool = setup_test_db().await;
        let engine = linear_engine();
        save_engine(&pool, &engine).await.unwrap();

        let loaded = load_engine(&pool, engine.engine_id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Short novel");
        assert_eq!(loaded.graph.nodes.len(), 3);
        assert_eq!(loaded.graph.node("writer").unwrap().chapters, Some(5));
    }

    #[tokio::test]
    async fn test_invalid_graph_is_not_saved() {
        let pool = setup_test_db().await;
        let mut engine = linear_engine();
        engine.graph.edges.push(GraphEdge {
            source: "output".to_string(),
            target: "ghost".to_string(),
        });
        assert!(save_engine(&pool, &engine).await.is_err());
        assert!(load_engine(&pool, engine.engine_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_engine_is_none() {
        let pool = setup_test_db().await;
        assert!(load_engine(&pool, Uuid::new_v4()).await.unwrap().is_none());
    }
}
