use std::collections::HashMap;
use std::future::IntoFuture;

use futures::Future;

use crate::{AsyncDB, Connection as ConnectionName};

/// Trait for making connections to an [`AsyncDB`].
///
/// Every file gets its own connections, so that session state set by one file never leaks into
/// another. Within a file, `connection` records select between several named sessions.
pub trait MakeConnection {
    /// The database type.
    type Conn: AsyncDB;
    /// The future returned by [`MakeConnection::make`].
    type MakeFuture: Future<Output = Result<Self::Conn, <Self::Conn as AsyncDB>::Error>>;

    /// Creates a new connection to the database.
    fn make(&mut self) -> Self::MakeFuture;
}

/// Make connections directly from a closure returning a future.
impl<D: AsyncDB, F, Fut> MakeConnection for F
where
    F: FnMut() -> Fut,
    Fut: IntoFuture<Output = Result<D, D::Error>>,
{
    type Conn = D;
    type MakeFuture = Fut::IntoFuture;

    fn make(&mut self) -> Self::MakeFuture {
        self().into_future()
    }
}

/// Connections established in a [`Runner`](crate::Runner).
pub(crate) struct Connections<D, M> {
    make_conn: M,
    conns: HashMap<ConnectionName, D>,
}

impl<D: AsyncDB, M: MakeConnection<Conn = D>> Connections<D, M> {
    pub fn new(make_conn: M) -> Self {
        Connections {
            make_conn,
            conns: HashMap::new(),
        }
    }

    /// Get a connection by name. Make a new connection if it doesn't exist.
    ///
    /// A connection that fails to open is not cached, the next case retries.
    pub async fn get(&mut self, name: ConnectionName) -> Result<&mut D, D::Error> {
        use std::collections::hash_map::Entry;

        let conn = match self.conns.entry(name) {
            Entry::Occupied(o) => o.into_mut(),
            Entry::Vacant(v) => {
                tracing::debug!(connection = ?v.key(), "opening connection");
                let conn = self.make_conn.make().await?;
                v.insert(conn)
            }
        };

        Ok(conn)
    }

    /// Drops the connection `name`, the next case using it opens a new one.
    pub fn remove(&mut self, name: &ConnectionName) {
        self.conns.remove(name);
    }
}
