//! Migration of paid staged orders into the permanent store.

mod migrator;
mod postgres;
mod store;

pub use migrator::{MigrationError, Migrator};
pub use postgres::PostgresPermanentStore;
pub use store::{
    InMemoryPermanentStore, NewCustomer, NewOrderLine, NewPermanentOrder, PermanentStore,
    PermanentStoreError, StoredCustomer, StoredMenuItem, StoredOrder,
};
