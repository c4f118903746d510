use std::sync::{Arc, Weak};

use anyhow::Result;
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::client::Client;

static INSTANCES: Lazy<Mutex<HashMap<String, Weak<Client>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Return the live client registered under `tag`, or build, register, and
/// return a new one. Entries are weak: they evaporate as soon as the last
/// strong reference drops, and dead entries are purged lazily on insert.
///
/// A caller constructing with a tag that is already live silently adopts
/// the earlier instance and its configuration.
pub(crate) fn shared<F>(tag: &str, build: F) -> Result<Arc<Client>>
where
    F: FnOnce() -> Result<Arc<Client>>,
{
    let mut instances = INSTANCES.lock();
    if let Some(existing) = instances.get(tag).and_then(Weak::upgrade) {
        return Ok(existing);
    }
    instances.retain(|_, weak| weak.strong_count() > 0);
    let client = build()?;
    instances.insert(tag.to_string(), Arc::downgrade(&client));
    Ok(client)
}
