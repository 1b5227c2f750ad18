#![warn(missing_docs)]
#![deny(
    missing_debug_implementations,
    rust_2018_idioms,
    single_use_lifetimes,
    unreachable_pub
)]

/*!
This crate provides the coordination layer shared by PLC protocol drivers: a
pool of leased connections, per-connection request admission and the
correlation of asynchronous responses with the requests that caused them.

Encoding frames and talking a specific protocol is left to the driver, which
plugs in through the [ConnectionFactory](crate::connection::ConnectionFactory)
and [Transport](crate::connection::Transport) traits. A plain TCP
implementation for stream based protocols ships with the crate
([TcpConnectionFactory](crate::connection::tcp::TcpConnectionFactory)).

# Usage

```toml
[dependencies]
plccore = "0.1"
```

# Examples
## Leasing a connection
Every endpoint gets at most one physical connection. Callers take turns
using it through exclusive, time-bounded leases and are served in the order
they asked.
```rust,no_run
# tokio_test::block_on(async {
use bytes::Bytes;
use plccore::{connection::tcp::TcpConnectionFactory, LeasePool};

// S7 devices listen on port 102, the TPKT length sits in the first frame bytes
let factory = TcpConnectionFactory::new().with_default_port(102);
let pool = LeasePool::builder(factory).concurrency(1).build()?;

let lease = pool.acquire("192.168.10.72", None).await?;
lease.send(Bytes::from_static(&[0x03, 0x00, 0x00, 0x04])).await?;

// hand the connection to the next caller
lease.close();
# Ok::<(), plccore::errors::Error>(())
# });
```

## Correlating responses
```rust
# tokio_test::block_on(async {
use std::time::Duration;
use bytes::Bytes;
use plccore::ExchangeRegistry;

let registry: ExchangeRegistry = ExchangeRegistry::new();
let handle = registry.register(42, Duration::from_millis(100))?;

// the inbound decode path resolves the exchange by key
assert!(registry.resolve(&42, Bytes::from_static(b"ok")));
assert_eq!(handle.await?, Bytes::from_static(b"ok"));
# Ok::<(), plccore::errors::Error>(())
# });
```
*/

pub mod connection;
pub mod errors;
pub mod exchange;
mod pool;
pub mod transaction;

pub use connection::tcp::TcpConnectionFactory;
pub use connection::{Authentication, ConnectionFactory, Transport};
pub use exchange::{CompletionHandle, ExchangeRegistry, KeySequence};
pub use pool::{Lease, LeasePool, PoolBuilder, PoolConfig, PoolStats};
pub use transaction::{Transaction, TransactionManager, TransactionState};
