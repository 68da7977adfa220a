/*!

The persistence layer: the two on-disk SQLite stores (metadata and
secret), the transactional SQL wrapper they share, and the
[credentials_db::CredentialsDatabase] façade that combines them.

 */
pub mod cache;
pub mod credentials_db;
pub mod metadata;
pub mod secret;
pub mod sql;
