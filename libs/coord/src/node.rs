//! Typed node helpers.
//!
//! Records stored in the coordination store implement [`Node`] so the
//! version they were read at travels with them and is presented back on
//! the next write.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Connection, CoordError, Result, Version, Watch};

/// A record that remembers the store version it was read at.
pub trait Node {
    fn version(&self) -> Option<Version>;

    fn set_version(&mut self, version: Version);
}

/// Reads and decodes a node, stamping the version it was read at.
pub async fn get_node<C, T>(conn: &C, path: &str) -> Result<T>
where
    C: Connection + ?Sized,
    T: Node + DeserializeOwned,
{
    let raw = conn.get(path).await?;
    let mut node: T = serde_json::from_value(raw.data)?;
    node.set_version(raw.version);
    Ok(node)
}

/// Watched variant of [`get_node`].
pub async fn get_node_w<C, T>(conn: &C, path: &str) -> Result<(T, Watch)>
where
    C: Connection + ?Sized,
    T: Node + DeserializeOwned,
{
    let (raw, watch) = conn.get_w(path).await?;
    let mut node: T = serde_json::from_value(raw.data)?;
    node.set_version(raw.version);
    Ok((node, watch))
}

/// Creates a node from a record and stamps the new version onto it.
pub async fn create_node<C, T>(conn: &C, path: &str, node: &mut T) -> Result<()>
where
    C: Connection + ?Sized,
    T: Node + Serialize,
{
    let data = serde_json::to_value(&*node)?;
    let version = conn.create(path, data).await?;
    node.set_version(version);
    Ok(())
}

/// Writes a record back using the version it was read at.
///
/// On success the record carries the new version, so it can be written
/// again without a re-read.
pub async fn set_node<C, T>(conn: &C, path: &str, node: &mut T) -> Result<()>
where
    C: Connection + ?Sized,
    T: Node + Serialize,
{
    let expected = node
        .version()
        .ok_or_else(|| CoordError::Unversioned(path.to_string()))?;
    let data = serde_json::to_value(&*node)?;
    let version = conn.set(path, data, expected).await?;
    node.set_version(version);
    Ok(())
}
