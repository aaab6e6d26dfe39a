use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use carechat_shared::types::{Role, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::User;

const USER_COLUMNS: &str = "id, display_name, role, specialty, is_active, created_at";

impl Database {
    /// Insert a user or update the mutable fields of an existing one.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, role, specialty, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                role = excluded.role,
                specialty = excluded.specialty,
                is_active = excluded.is_active",
            params![
                user.id.as_str(),
                user.display_name,
                user.role.as_str(),
                user.specialty,
                user.is_active,
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &UserId) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.as_str()],
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Associate a bearer token with a user, replacing any previous owner.
    pub fn register_token(&self, token: &str, user_id: &UserId) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO sessions (token, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![token, user_id.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Resolve a bearer token to an active user.
    pub fn user_for_token(&self, token: &str) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                "SELECT u.id, u.display_name, u.role, u.specialty, u.is_active, u.created_at
                 FROM sessions s JOIN users u ON u.id = s.user_id
                 WHERE s.token = ?1",
                params![token],
                row_to_user,
            )
            .optional()?;
        Ok(user.filter(|u| u.is_active))
    }

    /// Users holding one of `roles`, excluding `exclude`, ordered by name.
    pub fn list_users_by_roles(&self, roles: &[Role], exclude: &UserId) -> Result<Vec<User>> {
        if roles.is_empty() {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id != ?1 ORDER BY display_name COLLATE NOCASE, id"
        ))?;
        let rows = stmt.query_map(params![exclude.as_str()], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            let user = row?;
            if roles.contains(&user.role) {
                users.push(user);
            }
        }
        Ok(users)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let display_name: String = row.get(1)?;
    let role_str: String = row.get(2)?;
    let specialty: String = row.get(3)?;
    let is_active: bool = row.get(4)?;
    let ts_str: String = row.get(5)?;

    let role = role_str.parse::<Role>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    let created_at = parse_timestamp(5, &ts_str)?;

    Ok(User {
        id: UserId::new(id),
        display_name,
        role,
        specialty,
        is_active,
        created_at,
    })
}

pub(crate) fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user(&User::new("mid-1", "Nimali Silva", Role::Midwife).with_specialty("Colombo MOH"))
            .unwrap();
        db.upsert_user(&User::new("doc-1", "Dr. Perera", Role::Doctor).with_specialty("Obstetrics"))
            .unwrap();
        db.upsert_user(&User::new("mom-1", "Amaya", Role::Mom)).unwrap();
        db.upsert_user(&User::new("sp-1", "Baby Shop", Role::ServiceProvider))
            .unwrap();
        db
    }

    #[test]
    fn get_and_upsert() {
        let db = seeded();
        let mut user = db.get_user(&UserId::from("doc-1")).unwrap();
        assert_eq!(user.role, Role::Doctor);
        assert_eq!(user.specialty, "Obstetrics");

        user.display_name = "Dr. K. Perera".into();
        db.upsert_user(&user).unwrap();
        assert_eq!(
            db.get_user(&UserId::from("doc-1")).unwrap().display_name,
            "Dr. K. Perera"
        );

        assert!(matches!(
            db.get_user(&UserId::from("nobody")),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn tokens_resolve_to_active_users() {
        let db = seeded();
        db.register_token("tok-mid", &UserId::from("mid-1")).unwrap();
        let user = db.user_for_token("tok-mid").unwrap().unwrap();
        assert_eq!(user.id, UserId::from("mid-1"));
        assert!(db.user_for_token("unknown").unwrap().is_none());

        let mut mid = user;
        mid.is_active = false;
        db.upsert_user(&mid).unwrap();
        assert!(db.user_for_token("tok-mid").unwrap().is_none());
    }

    #[test]
    fn list_by_roles_excludes_self() {
        let db = seeded();
        db.upsert_user(&User::new("mid-2", "Kumari", Role::Midwife)).unwrap();

        let users = db
            .list_users_by_roles(&[Role::Doctor, Role::Mom], &UserId::from("mid-1"))
            .unwrap();
        let ids: Vec<_> = users.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["mom-1", "doc-1"]);

        let midwives = db
            .list_users_by_roles(&[Role::Midwife], &UserId::from("mid-1"))
            .unwrap();
        assert_eq!(midwives.len(), 1);
        assert_eq!(midwives[0].id, UserId::from("mid-2"));

        assert!(db
            .list_users_by_roles(&[], &UserId::from("mid-1"))
            .unwrap()
            .is_empty());
    }
}
