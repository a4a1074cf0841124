/// Errors raised while registering or evaluating write concerns.
///
/// Distinct from `sync_core::SyncError` — registration failures never
/// reach the core, only a fragment's resulting `FragmentReply` does.
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error(
        "concern for ({change_type:?}, '{class_name}') claims key '{key}' already claimed by \
         a concern with an indistinguishable `constrain` value — register with a differing \
         `constrain` to disambiguate"
    )]
    ConflictingConcern {
        change_type: sync_core::FragmentType,
        class_name: String,
        key: String,
    },
}
