use std::sync::Arc;

use hush_crypto::keys::MIN_RSA_BITS;
use hush_crypto::{KeyExchange, MemoryKeyVault, SessionTokens};
use hush_db::{ConversationStore, Database, IdentityStore};
use hush_gateway::LiveChannel;
use hush_types::models::{NewUser, UserId};
use uuid::Uuid;

use crate::indexer::ConversationIndexer;
use crate::service::ConversationService;

/// A registered user holding the private half of their message key.
pub(crate) struct Party {
    pub id: UserId,
    pub session_id: String,
    pub public_key: String,
}

/// Two provisioned users with message keys over an in-memory database.
pub(crate) struct Fixture {
    pub db: Arc<Database>,
    pub live: LiveChannel,
    /// Holds the users' private keys, standing in for their clients.
    pub clients: KeyExchange,
    pub alice: Party,
    pub bob: Party,
}

impl Fixture {
    pub fn new() -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let clients = KeyExchange::new(Arc::new(MemoryKeyVault::new()), MIN_RSA_BITS);

        let alice = Self::party(&db, &clients, "alice");
        let bob = Self::party(&db, &clients, "bob");

        Self {
            db,
            live: LiveChannel::new(),
            clients,
            alice,
            bob,
        }
    }

    fn party(db: &Database, clients: &KeyExchange, name: &str) -> Party {
        let id = create_user(db, name);
        let (session_id, public_key) = clients.issue_keypair().unwrap();
        // Same form login stores.
        let public_key = public_key.trim().to_string();
        db.set_user_key(id, &public_key).unwrap();
        Party {
            id,
            session_id,
            public_key,
        }
    }

    /// Register and provision another user, optionally with a message key.
    pub fn user(&self, name: &str, public_key: Option<&str>) -> UserId {
        let id = create_user(&self.db, name);
        if let Some(pem) = public_key {
            self.db.set_user_key(id, pem).unwrap();
        }
        id
    }

    pub fn indexer(&self) -> ConversationIndexer {
        ConversationIndexer::new(self.db.clone(), self.live.clone())
    }

    pub fn service(&self) -> ConversationService {
        ConversationService::new(
            self.db.clone(),
            self.db.clone(),
            KeyExchange::new(self.db.clone(), MIN_RSA_BITS),
            SessionTokens::from_secret("test-secret"),
            self.live.clone(),
            10,
        )
    }

    /// Decrypt a body stored for `party`, as their client would.
    pub fn open(&self, party: &Party, body: &str) -> String {
        self.clients.decrypt_text(&party.session_id, body).unwrap()
    }

    pub fn drop_summary(&self, owner: UserId, conversation_id: Uuid) {
        let table = hush_db::migrations::chats_table(owner).unwrap();
        self.db
            .with_conn(|conn| {
                conn.execute(
                    &format!("DELETE FROM {} WHERE chat_id = ?1", table),
                    [conversation_id.to_string()],
                )?;
                Ok(())
            })
            .unwrap();
    }
}

fn create_user(db: &Database, name: &str) -> UserId {
    let user = db
        .create(NewUser {
            name: name.to_string(),
            surname: "Tester".into(),
            handle: format!("@{}", name),
            login: name.to_string(),
            password_hash: "not-a-hash".into(),
        })
        .unwrap();
    db.provision(user.id).unwrap();
    user.id
}
