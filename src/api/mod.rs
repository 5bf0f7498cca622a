//! Firebase backend: Identity Toolkit for accounts, Firestore for documents.

pub mod auth;
pub mod fields;
pub mod firestore;

pub use auth::FirebaseAuth;
pub use firestore::FirestoreStore;
