//! SQLite implementation of the GraphRepository
//!
//! Properties are JSON text, embeddings little-endian `f32` blobs. SQLite has
//! no vector operator, so nearest-neighbour ranking is computed in process.
//! Multi-statement writes open with a write statement so the transaction holds
//! the writer lock before it reads anything.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::domain::graph::{
    BatchWrite, DanglingEdge, Direction, DuplicateEdgeGroup, Edge, EdgeKey, GraphRepository, GraphStats,
    MergePlan, MergeWrite, NeighborQuery, Node, Properties, ScoredNode, WriteOutcome, cosine_similarity,
};
use crate::domain::tasks::{TASK_NODE_TYPE, TaskStatus};
use crate::error::{Error, Result};

const NODE_COLUMNS: &str = "id, node_type, label, content, properties, embedding, created_at, updated_at";
const EDGE_COLUMNS: &str = "id, source_id, target_id, edge_type, properties, created_at";

/// Ids bound per `IN (...)` list
const ID_CHUNK: usize = 400;

/// SQLite implementation of the graph repository
#[derive(Clone)]
pub struct SqliteGraphRepository {
    pool: SqlitePool,
}

impl SqliteGraphRepository {
    /// Create a new SQLite graph repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_task_nodes(&self, sql: &str, binds: &[Option<&str>]) -> Result<Vec<Node>> {
        let mut query = sqlx::query_as::<_, NodeRow>(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(NodeRow::into_node).collect()
    }
}

#[async_trait]
impl GraphRepository for SqliteGraphRepository {
    // ========== Node Operations ==========

    async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let row: Option<NodeRow> = sqlx::query_as(&format!("SELECT {} FROM nodes WHERE id = ?", NODE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(NodeRow::into_node).transpose()
    }

    async fn get_nodes(&self, ids: &[String]) -> Result<Vec<Node>> {
        let mut nodes = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT {} FROM nodes WHERE id IN ({}) ORDER BY created_at, rowid",
                NODE_COLUMNS,
                placeholders(chunk.len())
            );
            let mut query = sqlx::query_as::<_, NodeRow>(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                nodes.push(row.into_node()?);
            }
        }
        Ok(nodes)
    }

    async fn list_nodes(&self, node_type: Option<&str>) -> Result<Vec<Node>> {
        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM nodes WHERE (? IS NULL OR node_type = ?) ORDER BY created_at, rowid",
            NODE_COLUMNS
        ))
        .bind(node_type)
        .bind(node_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NodeRow::into_node).collect()
    }

    async fn upsert_node(&self, node: &Node) -> Result<WriteOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = upsert_node_in(&mut tx, node).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn delete_nodes(&self, ids: &[String], detach: bool) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let list = placeholders(chunk.len());

            if detach {
                let sql = format!(
                    "DELETE FROM edges WHERE source_id IN ({list}) OR target_id IN ({list})",
                    list = list
                );
                let mut query = sqlx::query(&sql);
                for id in chunk.iter().chain(chunk) {
                    query = query.bind(id);
                }
                query.execute(&mut *tx).await?;
            }

            let sql = format!("DELETE FROM nodes WHERE id IN ({})", list);
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            deleted += query.execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        debug!(requested = ids.len(), deleted, detach, "Nodes deleted");
        Ok(deleted)
    }

    // ========== Edge Operations ==========

    async fn upsert_edge(&self, edge: &Edge) -> Result<WriteOutcome> {
        let mut tx = self.pool.begin().await?;
        let properties = serde_json::to_string(&edge.properties)?;

        let updated = sqlx::query(
            "UPDATE edges SET properties = ? WHERE source_id = ? AND target_id = ? AND edge_type = ?",
        )
        .bind(&properties)
        .bind(&edge.source_id)
        .bind(&edge.target_id)
        .bind(&edge.edge_type)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let outcome = if updated > 0 {
            WriteOutcome::Updated
        } else {
            sqlx::query(
                "INSERT INTO edges (source_id, target_id, edge_type, properties, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&edge.source_id)
            .bind(&edge.target_id)
            .bind(&edge.edge_type)
            .bind(&properties)
            .bind(format_ts(&edge.created_at))
            .execute(&mut *tx)
            .await?;
            WriteOutcome::Created
        };
        tx.commit().await?;

        Ok(outcome)
    }

    async fn get_edge(&self, key: &EdgeKey) -> Result<Option<Edge>> {
        let row: Option<EdgeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM edges WHERE source_id = ? AND target_id = ? AND edge_type = ? ORDER BY id LIMIT 1",
            EDGE_COLUMNS
        ))
        .bind(&key.source_id)
        .bind(&key.target_id)
        .bind(&key.edge_type)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EdgeRow::into_edge).transpose()
    }

    async fn delete_edge(&self, key: &EdgeKey) -> Result<u64> {
        let result = sqlx::query("DELETE FROM edges WHERE source_id = ? AND target_id = ? AND edge_type = ?")
            .bind(&key.source_id)
            .bind(&key.target_id)
            .bind(&key.edge_type)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_edges(&self, node_id: &str, direction: Direction, edge_type: Option<&str>) -> Result<Vec<Edge>> {
        let endpoint = match direction {
            Direction::Outgoing => "source_id = ?",
            Direction::Incoming => "target_id = ?",
            Direction::Both => "(source_id = ? OR target_id = ?)",
        };
        let sql = format!(
            "SELECT {} FROM edges WHERE {} AND (? IS NULL OR edge_type = ?) ORDER BY id",
            EDGE_COLUMNS, endpoint
        );

        let mut query = sqlx::query_as::<_, EdgeRow>(&sql).bind(node_id);
        if direction == Direction::Both {
            query = query.bind(node_id);
        }
        let rows = query.bind(edge_type).bind(edge_type).fetch_all(&self.pool).await?;

        rows.into_iter().map(EdgeRow::into_edge).collect()
    }

    async fn edges_touching(&self, ids: &[String]) -> Result<Vec<Edge>> {
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let list = placeholders(chunk.len());
            let sql = format!(
                "SELECT {cols} FROM edges WHERE source_id IN ({list}) OR target_id IN ({list})",
                cols = EDGE_COLUMNS,
                list = list
            );
            let mut query = sqlx::query_as::<_, EdgeRow>(&sql);
            for id in chunk.iter().chain(chunk) {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                if seen.insert(row.id) {
                    rows.push(row);
                }
            }
        }
        rows.sort_by_key(|r| r.id);
        rows.into_iter().map(EdgeRow::into_edge).collect()
    }

    // ========== Batch Operations ==========

    async fn write_batch(&self, nodes: &[Node], edges: &[Edge]) -> Result<BatchWrite> {
        let mut tx = self.pool.begin().await?;
        let mut batch = BatchWrite::default();

        for node in nodes {
            batch.nodes.push(upsert_node_in(&mut tx, node).await?);
        }
        for edge in edges {
            batch.edges.push(upsert_checked_edge_in(&mut tx, edge).await?);
        }
        tx.commit().await?;

        debug!(nodes = nodes.len(), edges = edges.len(), "Batch committed");
        Ok(batch)
    }

    // ========== Similarity ==========

    async fn nearest_neighbors(&self, query: &[f32], filter: &NeighborQuery) -> Result<Vec<ScoredNode>> {
        let rows: Vec<EmbeddingRow> = sqlx::query_as(
            r#"
            SELECT id, embedding FROM nodes
            WHERE embedding IS NOT NULL
              AND (? IS NULL OR node_type = ?)
              AND (? IS NULL OR id != ?)
            "#,
        )
        .bind(filter.node_type.as_deref())
        .bind(filter.node_type.as_deref())
        .bind(filter.exclude_id.as_deref())
        .bind(filter.exclude_id.as_deref())
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<(String, f32)> = rows
            .into_iter()
            .filter_map(|row| {
                let similarity = cosine_similarity(query, &decode_embedding(&row.embedding));
                (similarity >= filter.min_similarity).then_some((row.id, similarity))
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(filter.limit);

        let ids: Vec<String> = scored.iter().map(|(id, _)| id.clone()).collect();
        let mut nodes = self.get_nodes(&ids).await?;

        let mut results = Vec::with_capacity(scored.len());
        for (id, similarity) in scored {
            if let Some(pos) = nodes.iter().position(|n| n.id == id) {
                results.push(ScoredNode {
                    node: nodes.swap_remove(pos),
                    similarity,
                });
            }
        }
        Ok(results)
    }

    async fn text_search(&self, text: &str, node_type: Option<&str>, limit: usize) -> Result<Vec<Node>> {
        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM nodes
            WHERE (instr(lower(label), lower(?)) > 0 OR instr(lower(coalesce(content, '')), lower(?)) > 0)
              AND (? IS NULL OR node_type = ?)
            ORDER BY updated_at DESC, rowid DESC
            LIMIT ?
            "#,
            NODE_COLUMNS
        ))
        .bind(text)
        .bind(text)
        .bind(node_type)
        .bind(node_type)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NodeRow::into_node).collect()
    }

    // ========== Integrity Sweeps ==========

    async fn orphaned_nodes(&self) -> Result<Vec<Node>> {
        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM nodes n
            WHERE NOT EXISTS (SELECT 1 FROM edges e WHERE e.source_id = n.id)
              AND NOT EXISTS (SELECT 1 FROM edges e WHERE e.target_id = n.id)
            ORDER BY n.created_at, n.rowid
            "#,
            NODE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NodeRow::into_node).collect()
    }

    async fn dangling_edges(&self) -> Result<Vec<DanglingEdge>> {
        let rows: Vec<DanglingRow> = sqlx::query_as(
            r#"
            SELECT * FROM (
                SELECT e.id AS id, e.source_id AS source_id, e.target_id AS target_id,
                       e.edge_type AS edge_type, e.properties AS properties, e.created_at AS created_at,
                       NOT EXISTS (SELECT 1 FROM nodes n WHERE n.id = e.source_id) AS missing_source,
                       NOT EXISTS (SELECT 1 FROM nodes n WHERE n.id = e.target_id) AS missing_target
                FROM edges e
            )
            WHERE missing_source OR missing_target
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DanglingEdge {
                    missing_source: row.missing_source,
                    missing_target: row.missing_target,
                    edge: EdgeRow {
                        id: row.id,
                        source_id: row.source_id,
                        target_id: row.target_id,
                        edge_type: row.edge_type,
                        properties: row.properties,
                        created_at: row.created_at,
                    }
                    .into_edge()?,
                })
            })
            .collect()
    }

    async fn nodes_missing_embeddings(&self) -> Result<Vec<Node>> {
        let rows: Vec<NodeRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM nodes
            WHERE embedding IS NULL AND content IS NOT NULL AND trim(content) != ''
            ORDER BY created_at, rowid
            "#,
            NODE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NodeRow::into_node).collect()
    }

    async fn duplicate_edges(&self) -> Result<Vec<DuplicateEdgeGroup>> {
        let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT source_id, target_id, edge_type, COUNT(*) FROM edges
            GROUP BY source_id, target_id, edge_type
            HAVING COUNT(*) > 1
            ORDER BY source_id, target_id, edge_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(source_id, target_id, edge_type, count)| DuplicateEdgeGroup {
                key: EdgeKey::new(source_id, target_id, edge_type),
                count: count as u64,
            })
            .collect())
    }

    async fn self_loops(&self) -> Result<Vec<Edge>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM edges WHERE source_id = target_id ORDER BY id",
            EDGE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EdgeRow::into_edge).collect()
    }

    // ========== Merge ==========

    async fn merge_nodes(&self, plan: &MergePlan) -> Result<MergeWrite> {
        let mut tx = self.pool.begin().await?;

        let kept = sqlx::query("UPDATE nodes SET properties = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&plan.merged_properties)?)
            .bind(format_ts(&plan.updated_at))
            .bind(&plan.keep_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if kept == 0 {
            return Err(Error::NodeNotFound(plan.keep_id.clone()));
        }

        let removed: HashSet<&str> = plan.remove_ids.iter().map(String::as_str).collect();
        let resolve = |id: &str| -> String {
            if removed.contains(id) {
                plan.keep_id.clone()
            } else {
                id.to_string()
            }
        };

        let mut involved = plan.remove_ids.clone();
        involved.push(plan.keep_id.clone());
        let mut edges: Vec<EdgeRow> = Vec::new();
        for chunk in involved.chunks(ID_CHUNK) {
            let list = placeholders(chunk.len());
            let sql = format!(
                "SELECT {cols} FROM edges WHERE source_id IN ({list}) OR target_id IN ({list}) ORDER BY id",
                cols = EDGE_COLUMNS,
                list = list
            );
            let mut query = sqlx::query_as::<_, EdgeRow>(&sql);
            for id in chunk.iter().chain(chunk) {
                query = query.bind(id);
            }
            edges.extend(query.fetch_all(&mut *tx).await?);
        }
        edges.sort_by_key(|e| e.id);
        edges.dedup_by_key(|e| e.id);

        let touches_removed =
            |e: &EdgeRow| removed.contains(e.source_id.as_str()) || removed.contains(e.target_id.as_str());

        let mut keys: HashSet<EdgeKey> = edges
            .iter()
            .filter(|e| !touches_removed(e))
            .map(|e| EdgeKey::new(&e.source_id, &e.target_id, &e.edge_type))
            .collect();

        let mut edges_redirected = 0;
        let mut edges_dropped = 0;
        for edge in edges.iter().filter(|e| touches_removed(e)) {
            let key = EdgeKey::new(resolve(&edge.source_id), resolve(&edge.target_id), &edge.edge_type);

            if key.is_self_loop() || keys.contains(&key) {
                sqlx::query("DELETE FROM edges WHERE id = ?")
                    .bind(edge.id)
                    .execute(&mut *tx)
                    .await?;
                edges_dropped += 1;
            } else {
                sqlx::query("UPDATE edges SET source_id = ?, target_id = ? WHERE id = ?")
                    .bind(&key.source_id)
                    .bind(&key.target_id)
                    .bind(edge.id)
                    .execute(&mut *tx)
                    .await?;
                keys.insert(key);
                edges_redirected += 1;
            }
        }

        for chunk in plan.remove_ids.chunks(ID_CHUNK) {
            let sql = format!("DELETE FROM nodes WHERE id IN ({})", placeholders(chunk.len()));
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            query.execute(&mut *tx).await?;
        }

        let row: NodeRow = sqlx::query_as(&format!("SELECT {} FROM nodes WHERE id = ?", NODE_COLUMNS))
            .bind(&plan.keep_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(MergeWrite {
            edges_redirected,
            edges_dropped,
            merged_node: row.into_node()?,
        })
    }

    // ========== Task Queue ==========

    async fn insert_task(&self, task: &Node, anchor: &Node, edges: &[Edge]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let anchor_created = sqlx::query(
            r#"
            INSERT OR IGNORE INTO nodes (id, node_type, label, properties, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&anchor.id)
        .bind(&anchor.node_type)
        .bind(&anchor.label)
        .bind(serde_json::to_string(&anchor.properties)?)
        .bind(format_ts(&anchor.created_at))
        .bind(format_ts(&anchor.updated_at))
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        upsert_node_in(&mut tx, task).await?;

        for edge in edges {
            if let Err(reason) = upsert_checked_edge_in(&mut tx, edge).await? {
                // Dropping the transaction rolls back the task and the anchor
                debug!(task_id = %task.id, edge = %edge.key(), %reason, "Task insert rolled back");
                return Err(Error::TaskNotFound(edge.other_end(&task.id).to_string()));
            }
        }
        tx.commit().await?;

        debug!(task_id = %task.id, anchor_created, edges = edges.len(), "Task inserted");
        Ok(())
    }

    async fn find_active_task(&self, instruction: &str, chat_id: Option<&str>) -> Result<Option<Node>> {
        let sql = format!(
            r#"
            SELECT {} FROM nodes
            WHERE node_type = ?
              AND json_extract(properties, '$.status') IN ('pending', 'in_progress')
              AND json_extract(properties, '$.instruction') = ?
              AND (? IS NULL OR json_extract(properties, '$.chat_id') = ?)
            ORDER BY created_at, rowid
            LIMIT 1
            "#,
            NODE_COLUMNS
        );
        let nodes = self
            .fetch_task_nodes(&sql, &[Some(TASK_NODE_TYPE), Some(instruction), chat_id, chat_id])
            .await?;
        Ok(nodes.into_iter().next())
    }

    async fn claim_next_task(&self, claimed_at: DateTime<Utc>) -> Result<Option<Node>> {
        let now = format_ts(&claimed_at);
        let claimed: Option<NodeRow> = sqlx::query_as(&format!(
            r#"
            UPDATE nodes
            SET properties = json_set(properties, '$.status', 'in_progress', '$.started_at', ?),
                updated_at = ?
            WHERE id = (
                SELECT id FROM nodes
                WHERE node_type = ? AND json_extract(properties, '$.status') = 'pending'
                ORDER BY created_at, rowid
                LIMIT 1
            )
              AND json_extract(properties, '$.status') = 'pending'
            RETURNING {}
            "#,
            NODE_COLUMNS
        ))
        .bind(&now)
        .bind(&now)
        .bind(TASK_NODE_TYPE)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = claimed {
            let node = row.into_node()?;
            info!(task_id = %node.id, "Task claimed");
            return Ok(Some(node));
        }

        let (pending,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM nodes WHERE node_type = ? AND json_extract(properties, '$.status') = 'pending')",
        )
        .bind(TASK_NODE_TYPE)
        .fetch_one(&self.pool)
        .await?;

        if pending {
            Err(Error::Conflict("pending task was claimed by another worker".into()))
        } else {
            Ok(None)
        }
    }

    async fn transition_task(&self, task: &Node, expected: TaskStatus) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE nodes SET label = ?, content = ?, properties = ?, updated_at = ?
            WHERE id = ? AND node_type = ? AND json_extract(properties, '$.status') = ?
            "#,
        )
        .bind(&task.label)
        .bind(&task.content)
        .bind(serde_json::to_string(&task.properties)?)
        .bind(format_ts(&task.updated_at))
        .bind(&task.id)
        .bind(TASK_NODE_TYPE)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            return Ok(());
        }

        match self.get_node(&task.id).await? {
            Some(node) if node.node_type == TASK_NODE_TYPE => Err(Error::Conflict(format!(
                "task '{}' is no longer {}",
                task.id, expected
            ))),
            _ => Err(Error::TaskNotFound(task.id.clone())),
        }
    }

    async fn list_tasks(&self, status: Option<TaskStatus>, chat_id: Option<&str>) -> Result<Vec<Node>> {
        let sql = format!(
            r#"
            SELECT {} FROM nodes
            WHERE node_type = ?
              AND (? IS NULL OR json_extract(properties, '$.status') = ?)
              AND (? IS NULL OR json_extract(properties, '$.chat_id') = ?)
            ORDER BY created_at, rowid
            "#,
            NODE_COLUMNS
        );
        let status = status.map(|s| s.as_str());
        self.fetch_task_nodes(&sql, &[Some(TASK_NODE_TYPE), status, status, chat_id, chat_id])
            .await
    }

    async fn count_tasks_by_status(&self) -> Result<Vec<(String, u64)>> {
        let rows: Vec<(Option<String>, i64)> = sqlx::query_as(
            r#"
            SELECT json_extract(properties, '$.status') AS status, COUNT(*) FROM nodes
            WHERE node_type = ?
            GROUP BY status
            ORDER BY status
            "#,
        )
        .bind(TASK_NODE_TYPE)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(status, count)| status.map(|s| (s, count as u64)))
            .collect())
    }

    async fn delete_tasks_with_status(&self, status: TaskStatus) -> Result<u64> {
        const MATCHING: &str = "SELECT id FROM nodes WHERE node_type = ? AND json_extract(properties, '$.status') = ?";

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "DELETE FROM edges WHERE source_id IN ({m}) OR target_id IN ({m})",
            m = MATCHING
        ))
        .bind(TASK_NODE_TYPE)
        .bind(status.as_str())
        .bind(TASK_NODE_TYPE)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM nodes WHERE node_type = ? AND json_extract(properties, '$.status') = ?")
            .bind(TASK_NODE_TYPE)
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(deleted)
    }

    // ========== Statistics ==========

    async fn get_stats(&self) -> Result<GraphStats> {
        let (total_nodes,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await?;

        let (total_edges,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM edges")
            .fetch_one(&self.pool)
            .await?;

        let (nodes_with_embeddings,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM nodes WHERE embedding IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;

        let nodes_by_type: Vec<(String, i64)> = sqlx::query_as(
            "SELECT node_type, COUNT(*) FROM nodes GROUP BY node_type ORDER BY COUNT(*) DESC, node_type",
        )
        .fetch_all(&self.pool)
        .await?;

        let edges_by_type: Vec<(String, i64)> = sqlx::query_as(
            "SELECT edge_type, COUNT(*) FROM edges GROUP BY edge_type ORDER BY COUNT(*) DESC, edge_type",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(GraphStats {
            total_nodes: total_nodes as u64,
            total_edges: total_edges as u64,
            nodes_by_type: nodes_by_type.into_iter().map(|(t, c)| (t, c as u64)).collect(),
            edges_by_type: edges_by_type.into_iter().map(|(t, c)| (t, c as u64)).collect(),
            nodes_with_embeddings: nodes_with_embeddings as u64,
        })
    }
}

// ========== Statement Helpers ==========

/// Insert the node, or overwrite every column but `created_at` when it exists
async fn upsert_node_in(conn: &mut SqliteConnection, node: &Node) -> Result<WriteOutcome> {
    let properties = serde_json::to_string(&node.properties)?;
    let embedding = node.embedding.as_deref().map(encode_embedding);
    let dims = node.embedding.as_ref().map(|e| e.len() as i64);

    let inserted = sqlx::query(
        r#"
        INSERT OR IGNORE INTO nodes (id, node_type, label, content, properties, embedding, embedding_dims, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&node.id)
    .bind(&node.node_type)
    .bind(&node.label)
    .bind(&node.content)
    .bind(&properties)
    .bind(&embedding)
    .bind(dims)
    .bind(format_ts(&node.created_at))
    .bind(format_ts(&node.updated_at))
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if inserted > 0 {
        debug!(node_id = %node.id, "Node inserted");
        return Ok(WriteOutcome::Created);
    }

    sqlx::query(
        r#"
        UPDATE nodes
        SET node_type = ?, label = ?, content = ?, properties = ?, embedding = ?, embedding_dims = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&node.node_type)
    .bind(&node.label)
    .bind(&node.content)
    .bind(&properties)
    .bind(&embedding)
    .bind(dims)
    .bind(format_ts(&node.updated_at))
    .bind(&node.id)
    .execute(&mut *conn)
    .await?;

    debug!(node_id = %node.id, "Node updated");
    Ok(WriteOutcome::Updated)
}

/// Upsert an edge only if both endpoints exist; a missing endpoint is reported
/// in the inner `Err`
async fn upsert_checked_edge_in(
    conn: &mut SqliteConnection,
    edge: &Edge,
) -> Result<std::result::Result<WriteOutcome, String>> {
    const ENDPOINTS_EXIST: &str =
        "EXISTS (SELECT 1 FROM nodes WHERE id = ?) AND EXISTS (SELECT 1 FROM nodes WHERE id = ?)";
    let properties = serde_json::to_string(&edge.properties)?;

    let updated = sqlx::query(&format!(
        "UPDATE edges SET properties = ? WHERE source_id = ? AND target_id = ? AND edge_type = ? AND {}",
        ENDPOINTS_EXIST
    ))
    .bind(&properties)
    .bind(&edge.source_id)
    .bind(&edge.target_id)
    .bind(&edge.edge_type)
    .bind(&edge.source_id)
    .bind(&edge.target_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if updated > 0 {
        return Ok(Ok(WriteOutcome::Updated));
    }

    let inserted = sqlx::query(&format!(
        "INSERT INTO edges (source_id, target_id, edge_type, properties, created_at) SELECT ?, ?, ?, ?, ? WHERE {}",
        ENDPOINTS_EXIST
    ))
    .bind(&edge.source_id)
    .bind(&edge.target_id)
    .bind(&edge.edge_type)
    .bind(&properties)
    .bind(format_ts(&edge.created_at))
    .bind(&edge.source_id)
    .bind(&edge.target_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if inserted > 0 {
        return Ok(Ok(WriteOutcome::Created));
    }

    let mut missing = Vec::new();
    for id in [&edge.source_id, &edge.target_id] {
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM nodes WHERE id = ?)")
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;
        if !exists && !missing.contains(&id.as_str()) {
            missing.push(id.as_str());
        }
    }
    Ok(Err(format!("referenced node(s) not found: {}", missing.join(", "))))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Fixed-width RFC 3339 so that text order equals time order
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("Invalid timestamp '{}': {}", value, e)))
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ========== Database Row Types ==========

#[derive(Debug, FromRow)]
struct NodeRow {
    id: String,
    node_type: String,
    label: String,
    content: Option<String>,
    properties: String,
    embedding: Option<Vec<u8>>,
    created_at: String,
    updated_at: String,
}

impl NodeRow {
    fn into_node(self) -> Result<Node> {
        let properties: Properties = serde_json::from_str(&self.properties)?;

        Ok(Node {
            id: self.id,
            node_type: self.node_type,
            label: self.label,
            content: self.content,
            properties,
            embedding: self.embedding.as_deref().map(decode_embedding),
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct EdgeRow {
    id: i64,
    source_id: String,
    target_id: String,
    edge_type: String,
    properties: String,
    created_at: String,
}

impl EdgeRow {
    fn into_edge(self) -> Result<Edge> {
        Ok(Edge {
            source_id: self.source_id,
            target_id: self.target_id,
            edge_type: self.edge_type,
            properties: serde_json::from_str(&self.properties)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct DanglingRow {
    id: i64,
    source_id: String,
    target_id: String,
    edge_type: String,
    properties: String,
    created_at: String,
    missing_source: bool,
    missing_target: bool,
}

#[derive(Debug, FromRow)]
struct EmbeddingRow {
    id: String,
    embedding: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::run_migrations;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqliteGraphRepository {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test database");

        run_migrations(&pool).await.expect("Failed to run migrations");

        SqliteGraphRepository::new(pool)
    }

    fn task(id: &str, status: TaskStatus) -> Node {
        Node::new(id, TASK_NODE_TYPE, id)
            .with_property("status", status.as_str())
            .with_property("instruction", format!("do {}", id))
    }

    #[tokio::test]
    async fn test_upsert_node_keeps_created_at() {
        let repo = setup_test_db().await;
        let node = Node::new("a", "Concept", "A").with_property("k", 1);

        assert_eq!(repo.upsert_node(&node).await.unwrap(), WriteOutcome::Created);

        let mut changed = node.clone().with_property("k", 2);
        changed.created_at = node.created_at + chrono::Duration::hours(1);
        changed.updated_at = changed.created_at;
        assert_eq!(repo.upsert_node(&changed).await.unwrap(), WriteOutcome::Updated);

        let stored = repo.get_node("a").await.unwrap().unwrap();
        assert_eq!(stored.property("k"), Some(&json!(2)));
        assert_eq!(format_ts(&stored.created_at), format_ts(&node.created_at));
    }

    #[tokio::test]
    async fn test_embedding_blob_round_trip() {
        let repo = setup_test_db().await;
        let mut node = Node::new("e", "Memory", "E").with_content("text");
        node.embedding = Some(vec![0.25, -1.5, 3.0]);
        repo.upsert_node(&node).await.unwrap();

        let stored = repo.get_node("e").await.unwrap().unwrap();
        assert_eq!(stored.embedding, Some(vec![0.25, -1.5, 3.0]));
    }

    #[tokio::test]
    async fn test_upsert_edge_updates_in_place() {
        let repo = setup_test_db().await;
        let edge = Edge::new("a", "b", "LINK").with_property("w", 1);

        assert_eq!(repo.upsert_edge(&edge).await.unwrap(), WriteOutcome::Created);
        assert_eq!(
            repo.upsert_edge(&edge.clone().with_property("w", 2)).await.unwrap(),
            WriteOutcome::Updated
        );

        let stored = repo.get_edge(&edge.key()).await.unwrap().unwrap();
        assert_eq!(stored.properties.get("w"), Some(&json!(2)));
        assert!(repo.duplicate_edges().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_batch_checks_endpoints_per_edge() {
        let repo = setup_test_db().await;
        let nodes = vec![Node::new("a", "Concept", "A"), Node::new("b", "Concept", "B")];
        let edges = vec![
            Edge::new("a", "b", "LINK"),
            Edge::new("a", "x", "LINK"),
            Edge::new("y", "z", "LINK"),
        ];

        let batch = repo.write_batch(&nodes, &edges).await.unwrap();

        assert_eq!(batch.nodes, vec![WriteOutcome::Created, WriteOutcome::Created]);
        assert_eq!(batch.edges[0], Ok(WriteOutcome::Created));
        assert_eq!(batch.edges[1], Err("referenced node(s) not found: x".to_string()));
        assert_eq!(batch.edges[2], Err("referenced node(s) not found: y, z".to_string()));
        assert_eq!(repo.get_stats().await.unwrap().total_edges, 1);
    }

    #[tokio::test]
    async fn test_edges_touching_and_list_edges() {
        let repo = setup_test_db().await;
        for edge in [
            Edge::new("a", "b", "LINK"),
            Edge::new("b", "c", "LINK"),
            Edge::new("c", "a", "OTHER"),
            Edge::new("d", "e", "LINK"),
        ] {
            repo.upsert_edge(&edge).await.unwrap();
        }

        let touching = repo.edges_touching(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(touching.len(), 3);

        let outgoing = repo.list_edges("a", Direction::Outgoing, None).await.unwrap();
        assert_eq!(outgoing.len(), 1);
        let both = repo.list_edges("a", Direction::Both, None).await.unwrap();
        assert_eq!(both.len(), 2);
        let typed = repo.list_edges("a", Direction::Both, Some("OTHER")).await.unwrap();
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].source_id, "c");
    }

    #[tokio::test]
    async fn test_nearest_neighbors_filters_and_orders() {
        let repo = setup_test_db().await;
        for (id, node_type, embedding) in [
            ("q", "Memory", vec![1.0, 0.0]),
            ("close", "Memory", vec![0.9, 0.1]),
            ("mid", "Concept", vec![0.5, 0.5]),
            ("far", "Memory", vec![0.0, 1.0]),
        ] {
            let mut node = Node::new(id, node_type, id);
            node.embedding = Some(embedding);
            repo.upsert_node(&node).await.unwrap();
        }

        let query = NeighborQuery {
            node_type: None,
            exclude_id: Some("q".into()),
            min_similarity: 0.5,
            limit: 10,
        };
        let results = repo.nearest_neighbors(&[1.0, 0.0], &query).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.node.id.as_str()).collect();
        assert_eq!(ids, vec!["close", "mid"]);

        let typed = NeighborQuery {
            node_type: Some("Memory".into()),
            exclude_id: None,
            min_similarity: -1.0,
            limit: 2,
        };
        let results = repo.nearest_neighbors(&[1.0, 0.0], &typed).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.node.id.as_str()).collect();
        assert_eq!(ids, vec!["q", "close"]);
    }

    #[tokio::test]
    async fn test_text_search_is_case_insensitive() {
        let repo = setup_test_db().await;
        repo.upsert_node(&Node::new("a", "Concept", "Graph Theory")).await.unwrap();
        repo.upsert_node(&Node::new("b", "Memory", "note").with_content("about GRAPHS"))
            .await
            .unwrap();
        repo.upsert_node(&Node::new("c", "Memory", "unrelated")).await.unwrap();

        let hits = repo.text_search("graph", None, 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        let typed = repo.text_search("graph", Some("Memory"), 10).await.unwrap();
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].id, "b");
    }

    #[tokio::test]
    async fn test_integrity_sweeps() {
        let repo = setup_test_db().await;
        repo.upsert_node(&Node::new("a", "Concept", "A")).await.unwrap();
        repo.upsert_node(&Node::new("lonely", "Concept", "L").with_content("text"))
            .await
            .unwrap();
        repo.upsert_edge(&Edge::new("a", "a", "SELF")).await.unwrap();
        repo.upsert_edge(&Edge::new("ghost", "a", "LINK")).await.unwrap();

        for _ in 0..2 {
            sqlx::query(
                "INSERT INTO edges (source_id, target_id, edge_type, properties, created_at) VALUES ('a', 'ghost', 'DUP', '{}', ?)",
            )
            .bind(format_ts(&Utc::now()))
            .execute(&repo.pool)
            .await
            .unwrap();
        }

        let orphans = repo.orphaned_nodes().await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, "lonely");

        let dangling = repo.dangling_edges().await.unwrap();
        assert_eq!(dangling.len(), 3);
        assert!(dangling[0].missing_source);
        assert!(!dangling[0].missing_target);
        assert!(dangling[1].missing_target);

        let duplicates = repo.duplicate_edges().await.unwrap();
        assert_eq!(duplicates, vec![DuplicateEdgeGroup {
            key: EdgeKey::new("a", "ghost", "DUP"),
            count: 2,
        }]);

        assert_eq!(repo.self_loops().await.unwrap().len(), 1);
        assert_eq!(repo.nodes_missing_embeddings().await.unwrap()[0].id, "lonely");
    }

    #[tokio::test]
    async fn test_merge_nodes_transaction() {
        let repo = setup_test_db().await;
        for id in ["x", "y", "z"] {
            repo.upsert_node(&Node::new(id, "Concept", id)).await.unwrap();
        }
        repo.upsert_edge(&Edge::new("x", "z", "LINK")).await.unwrap();
        repo.upsert_edge(&Edge::new("y", "z", "LINK")).await.unwrap();
        repo.upsert_edge(&Edge::new("z", "x", "BACK")).await.unwrap();
        repo.upsert_edge(&Edge::new("y", "x", "SAME")).await.unwrap();

        let mut merged_properties = Properties::new();
        merged_properties.insert("merged".into(), json!(true));
        let plan = MergePlan {
            keep_id: "y".into(),
            remove_ids: vec!["x".into()],
            merged_properties,
            updated_at: Utc::now(),
        };

        let written = repo.merge_nodes(&plan).await.unwrap();
        assert_eq!(written.edges_redirected, 1);
        assert_eq!(written.edges_dropped, 2);
        assert_eq!(written.merged_node.property("merged"), Some(&json!(true)));

        assert!(repo.get_node("x").await.unwrap().is_none());
        assert!(repo.get_edge(&EdgeKey::new("z", "y", "BACK")).await.unwrap().is_some());
        assert!(repo.dangling_edges().await.unwrap().is_empty());
        assert!(repo.duplicate_edges().await.unwrap().is_empty());
        assert!(repo.self_loops().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_nodes_missing_keep_rolls_back() {
        let repo = setup_test_db().await;
        repo.upsert_node(&Node::new("x", "Concept", "x")).await.unwrap();

        let plan = MergePlan {
            keep_id: "missing".into(),
            remove_ids: vec!["x".into()],
            merged_properties: Properties::new(),
            updated_at: Utc::now(),
        };
        assert!(repo.merge_nodes(&plan).await.unwrap_err().is_not_found());
        assert!(repo.get_node("x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_claim_takes_oldest_pending() {
        let repo = setup_test_db().await;
        let base = Utc::now();
        for (offset, id, status) in [
            (0, "t0", TaskStatus::Completed),
            (1, "t1", TaskStatus::Pending),
            (2, "t2", TaskStatus::Pending),
        ] {
            let mut node = task(id, status);
            node.created_at = base + chrono::Duration::seconds(offset);
            repo.upsert_node(&node).await.unwrap();
        }

        let claimed = repo.claim_next_task(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, "t1");
        assert_eq!(claimed.property_str("status"), Some("in_progress"));
        assert!(claimed.property_str("started_at").is_some());

        assert_eq!(repo.claim_next_task(Utc::now()).await.unwrap().unwrap().id, "t2");
        assert!(repo.claim_next_task(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_task_is_compare_and_swap() {
        let repo = setup_test_db().await;
        let pending = task("t", TaskStatus::Pending);
        repo.upsert_node(&pending).await.unwrap();

        let done = pending.clone().with_property("status", "completed");
        repo.transition_task(&done, TaskStatus::Pending).await.unwrap();

        let err = repo.transition_task(&done, TaskStatus::Pending).await.unwrap_err();
        assert!(err.is_conflict());

        let err = repo
            .transition_task(&task("missing", TaskStatus::Completed), TaskStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_insert_task_writes_task_anchor_and_edges() {
        let repo = setup_test_db().await;
        repo.upsert_node(&task("dep", TaskStatus::Completed)).await.unwrap();
        let anchor = Node::new("concept:tasks", "Concept", "Tasks");
        let edges = [
            Edge::new("t", "concept:tasks", "INSTANCE_OF"),
            Edge::new("t", "dep", "DEPENDS_ON"),
        ];

        repo.insert_task(&task("t", TaskStatus::Pending), &anchor, &edges)
            .await
            .unwrap();

        assert!(repo.get_node("concept:tasks").await.unwrap().is_some());
        assert_eq!(repo.get_stats().await.unwrap().total_edges, 2);

        // A second task reuses the anchor without rewriting it
        let renamed = Node::new("concept:tasks", "Concept", "Renamed");
        repo.insert_task(&task("u", TaskStatus::Pending), &renamed, &edges[..1])
            .await
            .unwrap();
        assert_eq!(repo.get_node("concept:tasks").await.unwrap().unwrap().label, "Tasks");
    }

    #[tokio::test]
    async fn test_insert_task_with_missing_dependency_writes_nothing() {
        let repo = setup_test_db().await;
        let anchor = Node::new("concept:tasks", "Concept", "Tasks");
        let edges = [
            Edge::new("t", "concept:tasks", "INSTANCE_OF"),
            Edge::new("t", "gone", "DEPENDS_ON"),
        ];

        let err = repo
            .insert_task(&task("t", TaskStatus::Pending), &anchor, &edges)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(id) if id == "gone"));

        assert!(repo.get_node("t").await.unwrap().is_none());
        assert!(repo.get_node("concept:tasks").await.unwrap().is_none());
        let stats = repo.get_stats().await.unwrap();
        assert_eq!((stats.total_nodes, stats.total_edges), (0, 0));
        assert!(repo.claim_next_task(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_task_queries() {
        let repo = setup_test_db().await;
        repo.upsert_node(&task("a", TaskStatus::Pending).with_property("chat_id", "c1"))
            .await
            .unwrap();
        repo.upsert_node(&task("b", TaskStatus::Completed)).await.unwrap();
        repo.upsert_node(&task("c", TaskStatus::Completed)).await.unwrap();
        repo.upsert_edge(&Edge::new("a", "b", "DEPENDS_ON")).await.unwrap();

        assert_eq!(repo.list_tasks(None, None).await.unwrap().len(), 3);
        assert_eq!(repo.list_tasks(Some(TaskStatus::Completed), None).await.unwrap().len(), 2);
        assert_eq!(repo.list_tasks(None, Some("c1")).await.unwrap().len(), 1);

        let active = repo.find_active_task("do a", None).await.unwrap();
        assert_eq!(active.map(|n| n.id), Some("a".to_string()));
        assert!(repo.find_active_task("do a", Some("c2")).await.unwrap().is_none());
        assert!(repo.find_active_task("do b", None).await.unwrap().is_none());

        let counts = repo.count_tasks_by_status().await.unwrap();
        assert_eq!(counts, vec![("completed".to_string(), 2), ("pending".to_string(), 1)]);

        assert_eq!(repo.delete_tasks_with_status(TaskStatus::Completed).await.unwrap(), 2);
        assert_eq!(repo.get_stats().await.unwrap().total_edges, 0);
        assert_eq!(repo.get_stats().await.unwrap().total_nodes, 1);
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let late = early + chrono::Duration::microseconds(1_500_000);
        assert_eq!(format_ts(&early), "2024-01-01T00:00:00.000000Z");
        assert!(format_ts(&early) < format_ts(&late));
        assert_eq!(parse_ts(&format_ts(&late)).unwrap(), late);
    }
}
