//! Liveness checks for previously provisioned remote objects.
//!
//! Each [`ObjectKind`] maps to exactly one `retrieve_*` call on the
//! [`RemoteService`]. A not-found answer becomes [`Liveness::NotFound`]; any
//! other failure is returned to the caller untouched. Nothing here retries.

use std::fmt;

use crate::remote::{RemoteError, RemoteService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Assistant,
    VectorStore,
    File,
    Thread,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectKind::Assistant => "assistant",
            ObjectKind::VectorStore => "vector store",
            ObjectKind::File => "file",
            ObjectKind::Thread => "thread",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Valid,
    NotFound,
}

pub async fn validate(
    service: &dyn RemoteService,
    kind: ObjectKind,
    id: &str,
) -> Result<Liveness, RemoteError> {
    let lookup = match kind {
        ObjectKind::Assistant => service.retrieve_assistant(id).await,
        ObjectKind::VectorStore => service.retrieve_vector_store(id).await,
        ObjectKind::File => service.retrieve_file(id).await,
        ObjectKind::Thread => service.retrieve_thread(id).await,
    };

    match lookup {
        Ok(_) => Ok(Liveness::Valid),
        Err(e) if e.is_not_found() => {
            tracing::debug!(%kind, id, "remote object is gone");
            Ok(Liveness::NotFound)
        }
        Err(e) => Err(e),
    }
}

/// Check `objects` in order and return the first one that no longer exists.
///
/// Stops at the first missing object or the first error.
pub async fn first_missing<'a>(
    service: &dyn RemoteService,
    objects: &'a [(ObjectKind, String)],
) -> Result<Option<&'a (ObjectKind, String)>, RemoteError> {
    for object in objects {
        let (kind, id) = object;
        if validate(service, *kind, id).await? == Liveness::NotFound {
            return Ok(Some(object));
        }
    }
    Ok(None)
}
