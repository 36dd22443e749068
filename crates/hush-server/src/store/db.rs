use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use super::model::{AccessStats, NewSecret, SecretRecord};
use crate::gatekeeper::{self, AccessContext, AccessDecision};

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");
/// Secondary index: creator identifier -> secret identifier.
const CREATORS: TableDefinition<&str, &str> = TableDefinition::new("creators");

/// Thread-safe handle to the redb store.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database at `path` and ensure all tables exist.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(CREATORS)?;
        write_txn.open_table(super::queue::READY)?;
        write_txn.open_table(super::queue::PENDING)?;
        write_txn.open_table(super::coordination::LEASES)?;
        write_txn.open_table(super::coordination::COUNTERS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn unix_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Store a new secret, allocating both capability tokens.
    /// Returns `(identifier, creator_identifier)`.
    pub fn create_secret(&self, new: NewSecret) -> Result<(String, String)> {
        let write_txn = self.db.begin_write()?;
        let (identifier, creator_identifier) = {
            let mut secrets = write_txn.open_table(SECRETS)?;
            let mut creators = write_txn.open_table(CREATORS)?;

            let mut identifier = super::model::generate_token();
            while secrets.get(identifier.as_str())?.is_some() {
                identifier = super::model::generate_token();
            }
            let mut creator_identifier = super::model::generate_token();
            while creator_identifier == identifier
                || creators.get(creator_identifier.as_str())?.is_some()
            {
                creator_identifier = super::model::generate_token();
            }

            let record = SecretRecord {
                identifier: identifier.clone(),
                creator_identifier: creator_identifier.clone(),
                encrypted_secret: new.encrypted_secret,
                ip_restrictions: new.ip_restrictions,
                max_views: new.max_views,
                current_views: 0,
                secret_password: new.secret_password,
                expiration_date: new.expiration_date,
                email_notification: new.email_notification,
                access_logs: Vec::new(),
                created_at: Self::unix_now(),
            };

            let bytes = encode(&record)?;
            secrets.insert(identifier.as_str(), bytes.as_slice())?;
            creators.insert(creator_identifier.as_str(), identifier.as_str())?;
            (identifier, creator_identifier)
        };
        write_txn.commit()?;

        debug!(identifier = %identifier, "stored secret");
        Ok((identifier, creator_identifier))
    }

    /// Run the full gatekeeper sequence against a secret: load, check in
    /// order, append exactly one log entry, and increment the view counter
    /// on a grant. The whole sequence executes inside one write transaction,
    /// so concurrent accesses serialize and `max_views` cannot be exceeded.
    pub fn gate_access(
        &self,
        identifier: &str,
        supplied_password: Option<&str>,
        ctx: &AccessContext,
    ) -> Result<AccessDecision> {
        let now = Self::unix_now();

        let write_txn = self.db.begin_write()?;
        let decision = {
            let mut table = write_txn.open_table(SECRETS)?;

            // Clone the raw bytes so the AccessGuard borrow ends before mutation.
            let raw: Option<Vec<u8>> = table.get(identifier)?.map(|g| g.value().to_vec());

            match raw {
                // No record to attach a log entry to.
                None => AccessDecision::NotFound,
                Some(bytes) => {
                    let mut record = decode(&bytes)?;
                    let denial =
                        gatekeeper::deny_reason(&record, supplied_password, &ctx.ip, now);
                    let granted = denial.is_none();

                    record.access_logs.push(ctx.log_entry(granted, now));
                    if granted {
                        record.current_views += 1;
                    }

                    let updated = encode(&record)?;
                    table.insert(identifier, updated.as_slice())?;

                    match denial {
                        Some(reason) => reason,
                        None => AccessDecision::Granted {
                            secret: record.encrypted_secret.clone(),
                            notify: record.email_notification.clone(),
                        },
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(decision)
    }

    /// Delete a secret by its creator identifier. Returns true if it existed.
    pub fn delete_by_creator(&self, creator_identifier: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut creators = write_txn.open_table(CREATORS)?;
            let identifier: Option<String> = creators
                .remove(creator_identifier)?
                .map(|g| g.value().to_owned());

            match identifier {
                None => false,
                Some(id) => {
                    let mut secrets = write_txn.open_table(SECRETS)?;
                    secrets.remove(id.as_str())?;
                    true
                }
            }
        };
        write_txn.commit()?;

        if existed {
            debug!(creator = %creator_identifier, "deleted secret");
        }
        Ok(existed)
    }

    /// Load a secret by its creator identifier without touching logs or counters.
    pub fn find_by_creator(&self, creator_identifier: &str) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let creators = read_txn.open_table(CREATORS)?;

        let identifier: Option<String> = creators
            .get(creator_identifier)?
            .map(|g| g.value().to_owned());

        let Some(id) = identifier else {
            return Ok(None);
        };

        let secrets = read_txn.open_table(SECRETS)?;
        match secrets.get(id.as_str())? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Summarize a secret's access log.
    pub fn stats_by_creator(&self, creator_identifier: &str) -> Result<Option<AccessStats>> {
        let Some(record) = self.find_by_creator(creator_identifier)? else {
            return Ok(None);
        };

        let mut ips: Vec<&str> = record.access_logs.iter().map(|l| l.ip_address.as_str()).collect();
        ips.sort_unstable();
        ips.dedup();

        Ok(Some(AccessStats {
            total_attempts: record.access_logs.len(),
            granted_attempts: record
                .access_logs
                .iter()
                .filter(|l| l.access_granted)
                .count(),
            distinct_ips: ips.len(),
            current_views: record.current_views,
        }))
    }

    /// Cheap liveness probe used by the health endpoint.
    pub fn ping(&self) -> Result<()> {
        let read_txn = self.db.begin_read()?;
        read_txn.open_table(SECRETS)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn get_record(&self, identifier: &str) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        match table.get(identifier)? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }
}

fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(record, bincode::config::standard()).context("bincode encode")
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode")?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    pub(crate) fn make_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(&path).unwrap();
        (store, dir)
    }

    fn ctx(ip: &str) -> AccessContext {
        AccessContext {
            ip: ip.into(),
            ..Default::default()
        }
    }

    fn new_secret() -> NewSecret {
        NewSecret {
            encrypted_secret: "ciphertext".into(),
            ip_restrictions: vec![],
            max_views: 1,
            secret_password: None,
            expiration_date: None,
            email_notification: None,
        }
    }

    #[test]
    fn create_allocates_distinct_tokens() {
        let (s, _dir) = make_store();
        let (id, creator) = s.create_secret(new_secret()).unwrap();
        assert_ne!(id, creator);
        let record = s.get_record(&id).unwrap().unwrap();
        assert_eq!(record.current_views, 0);
        assert!(record.access_logs.is_empty());
    }

    #[test]
    fn grant_returns_ciphertext_and_increments() {
        let (s, _dir) = make_store();
        let (id, _) = s.create_secret(new_secret()).unwrap();

        let decision = s.gate_access(&id, None, &ctx("1.2.3.4")).unwrap();
        assert_eq!(
            decision,
            AccessDecision::Granted {
                secret: "ciphertext".into(),
                notify: None,
            }
        );

        let record = s.get_record(&id).unwrap().unwrap();
        assert_eq!(record.current_views, 1);
        assert_eq!(record.access_logs.len(), 1);
        assert!(record.access_logs[0].access_granted);
    }

    #[test]
    fn unknown_identifier_is_not_found() {
        let (s, _dir) = make_store();
        let decision = s.gate_access("missing", None, &ctx("1.2.3.4")).unwrap();
        assert_eq!(decision, AccessDecision::NotFound);
    }

    #[test]
    fn view_limit_denial_after_exactly_n_grants() {
        let (s, _dir) = make_store();
        let mut new = new_secret();
        new.max_views = 3;
        let (id, _) = s.create_secret(new).unwrap();

        for _ in 0..3 {
            assert!(s.gate_access(&id, None, &ctx("1.2.3.4")).unwrap().is_granted());
        }
        assert_eq!(
            s.gate_access(&id, None, &ctx("1.2.3.4")).unwrap(),
            AccessDecision::ViewLimitReached
        );

        let record = s.get_record(&id).unwrap().unwrap();
        assert_eq!(record.current_views, 3);
        assert_eq!(record.access_logs.len(), 4);
    }

    #[test]
    fn racing_final_view_grants_exactly_once() {
        let (s, _dir) = make_store();
        let (id, _) = s.create_secret(new_secret()).unwrap(); // max_views = 1

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let s = s.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    s.gate_access(&id, None, &ctx(&format!("10.0.0.{i}")))
                        .unwrap()
                        .is_granted()
                })
            })
            .collect();

        let grants = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(grants, 1);

        let record = s.get_record(&id).unwrap().unwrap();
        assert_eq!(record.current_views, 1);
        assert_eq!(record.access_logs.len(), 8);
    }

    #[test]
    fn denied_attempts_do_not_consume_views() {
        let (s, _dir) = make_store();
        let mut new = new_secret();
        new.max_views = 2;
        new.secret_password = Some("pw".into());
        let (id, _) = s.create_secret(new).unwrap();

        // Interleave denied password attempts with grants; only grants count.
        assert_eq!(
            s.gate_access(&id, None, &ctx("1.2.3.4")).unwrap(),
            AccessDecision::InvalidPassword
        );
        assert!(s.gate_access(&id, Some("pw"), &ctx("1.2.3.4")).unwrap().is_granted());
        assert_eq!(
            s.gate_access(&id, Some("nope"), &ctx("1.2.3.4")).unwrap(),
            AccessDecision::InvalidPassword
        );
        assert!(s.gate_access(&id, Some("pw"), &ctx("1.2.3.4")).unwrap().is_granted());
        assert_eq!(
            s.gate_access(&id, Some("pw"), &ctx("1.2.3.4")).unwrap(),
            AccessDecision::ViewLimitReached
        );

        let record = s.get_record(&id).unwrap().unwrap();
        assert_eq!(record.current_views, 2);
        assert_eq!(record.access_logs.len(), 5);
    }

    #[test]
    fn denial_is_logged_and_persisted() {
        let (s, _dir) = make_store();
        let mut new = new_secret();
        new.expiration_date = Some(Store::unix_now() - 10);
        let (id, _) = s.create_secret(new).unwrap();

        assert_eq!(
            s.gate_access(&id, None, &ctx("9.9.9.9")).unwrap(),
            AccessDecision::Expired
        );

        let record = s.get_record(&id).unwrap().unwrap();
        assert_eq!(record.access_logs.len(), 1);
        assert!(!record.access_logs[0].access_granted);
        assert_eq!(record.access_logs[0].ip_address, "9.9.9.9");
        assert_eq!(record.current_views, 0);
    }

    #[test]
    fn grant_carries_notification_address() {
        let (s, _dir) = make_store();
        let mut new = new_secret();
        new.email_notification = Some("owner@example.com".into());
        let (id, _) = s.create_secret(new).unwrap();

        match s.gate_access(&id, None, &ctx("1.2.3.4")).unwrap() {
            AccessDecision::Granted { notify, .. } => {
                assert_eq!(notify.as_deref(), Some("owner@example.com"));
            }
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn delete_is_idempotent() {
        let (s, _dir) = make_store();
        let (id, creator) = s.create_secret(new_secret()).unwrap();

        assert!(s.delete_by_creator(&creator).unwrap());
        assert!(!s.delete_by_creator(&creator).unwrap());
        assert_eq!(
            s.gate_access(&id, None, &ctx("1.2.3.4")).unwrap(),
            AccessDecision::NotFound
        );
    }

    #[test]
    fn recipient_identifier_cannot_delete() {
        let (s, _dir) = make_store();
        let (id, _) = s.create_secret(new_secret()).unwrap();
        assert!(!s.delete_by_creator(&id).unwrap());
    }

    #[test]
    fn logs_are_ordered_by_attempt() {
        let (s, _dir) = make_store();
        let mut new = new_secret();
        new.max_views = 0; // unlimited
        let (id, creator) = s.create_secret(new).unwrap();

        s.gate_access(&id, None, &ctx("1.1.1.1")).unwrap();
        s.gate_access(&id, None, &ctx("2.2.2.2")).unwrap();
        s.gate_access(&id, None, &ctx("3.3.3.3")).unwrap();

        let record = s.find_by_creator(&creator).unwrap().unwrap();
        let ips: Vec<_> = record
            .access_logs
            .iter()
            .map(|l| l.ip_address.as_str())
            .collect();
        assert_eq!(ips, vec!["1.1.1.1", "2.2.2.2", "3.3.3.3"]);
    }

    #[test]
    fn stats_summarize_the_log() {
        let (s, _dir) = make_store();
        let mut new = new_secret();
        new.max_views = 2;
        let (id, creator) = s.create_secret(new).unwrap();

        s.gate_access(&id, None, &ctx("1.1.1.1")).unwrap(); // grant
        s.gate_access(&id, None, &ctx("1.1.1.1")).unwrap(); // grant
        s.gate_access(&id, None, &ctx("2.2.2.2")).unwrap(); // view limit

        let stats = s.stats_by_creator(&creator).unwrap().unwrap();
        assert_eq!(
            stats,
            AccessStats {
                total_attempts: 3,
                granted_attempts: 2,
                distinct_ips: 2,
                current_views: 2,
            }
        );
    }

    #[test]
    fn stats_unknown_creator_is_none() {
        let (s, _dir) = make_store();
        assert!(s.stats_by_creator("missing").unwrap().is_none());
    }
}
