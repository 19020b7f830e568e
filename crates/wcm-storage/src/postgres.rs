use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;
use wcm_core::{
    Actor, AuditEntry, CollectorId, CollectorProfile, CollectorRating, CollectorWorkload,
    ContactInfo, GeoPoint, ModelError, PaymentRecord, Request, RequestId, RequestStatus, Role,
    Schedule, ScheduleId, ScheduleStatus, Stop,
};

use crate::{CompletionWindow, Store, StoreError};

/// PostgreSQL-backed store. Schema lives in the workspace `migrations/` directory.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn stops_for(&self, schedule_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<Stop>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, schedule_id, location_name, location_type, address, barangay,
                   latitude, longitude, request_id, completed_at, completed_by_role,
                   completed_by_id
              FROM schedule_stops
             WHERE schedule_id = ANY($1)
             ORDER BY schedule_id, position
            "#,
        )
        .bind(schedule_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out: HashMap<Uuid, Vec<Stop>> = HashMap::new();
        for row in rows {
            let schedule_id: Uuid = row.try_get("schedule_id")?;
            out.entry(schedule_id).or_default().push(stop_from_row(&row)?);
        }
        Ok(out)
    }
}

fn parse_label<T>(value: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = ModelError>,
{
    value.parse().map_err(|err: ModelError| StoreError::Decode(err.to_string()))
}

fn revision_from_db(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Decode(format!("negative revision {value}")))
}

fn revision_to_db(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Decode(format!("revision {value} overflows BIGINT")))
}

fn request_from_row(row: &PgRow) -> Result<Request, StoreError> {
    let priority: String = row.try_get("priority")?;
    let status: String = row.try_get("status")?;
    let photo_refs: Json<Vec<String>> = row.try_get("photo_refs")?;
    Ok(Request {
        id: row.try_get("id")?,
        request_number: row.try_get("request_number")?,
        client_id: row.try_get("client_id")?,
        contact: ContactInfo {
            name: row.try_get("contact_name")?,
            phone: row.try_get("contact_phone")?,
            email: row.try_get("contact_email")?,
        },
        barangay: row.try_get("barangay")?,
        address: row.try_get("address")?,
        priority: parse_label(&priority)?,
        preferred_date: row.try_get("preferred_date")?,
        preferred_time_slot: row.try_get("preferred_time_slot")?,
        special_instructions: row.try_get("special_instructions")?,
        photo_refs: photo_refs.0,
        status: parse_label(&status)?,
        rejection_reason: row.try_get("rejection_reason")?,
        cancellation_reason: row.try_get("cancellation_reason")?,
        assigned_collector: row.try_get("assigned_collector")?,
        assignment_notes: row.try_get("assignment_notes")?,
        completed_by: row.try_get("completed_by")?,
        payment_id: row.try_get("payment_id")?,
        revision: revision_from_db(row.try_get("revision")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn schedule_from_row(row: &PgRow, stops: Vec<Stop>) -> Result<Schedule, StoreError> {
    let schedule_type: String = row.try_get("schedule_type")?;
    let status: String = row.try_get("status")?;
    Ok(Schedule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        schedule_type: parse_label(&schedule_type)?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        status: parse_label(&status)?,
        special_instructions: row.try_get("special_instructions")?,
        primary_collector: row.try_get("primary_collector")?,
        backup_collector: row.try_get("backup_collector")?,
        stops,
        created_by: row.try_get("created_by")?,
        revision: revision_from_db(row.try_get("revision")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn stop_from_row(row: &PgRow) -> Result<Stop, StoreError> {
    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;
    let completed_by_role: Option<String> = row.try_get("completed_by_role")?;
    let completed_by_id: Option<Uuid> = row.try_get("completed_by_id")?;
    let completed_by = match (completed_by_role, completed_by_id) {
        (Some(role), Some(id)) => Some(Actor::new(parse_label::<Role>(&role)?, id)),
        _ => None,
    };
    Ok(Stop {
        id: row.try_get("id")?,
        location_name: row.try_get("location_name")?,
        location_type: row.try_get("location_type")?,
        address: row.try_get("address")?,
        barangay: row.try_get("barangay")?,
        coordinates: match (latitude, longitude) {
            (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
            _ => None,
        },
        request_id: row.try_get("request_id")?,
        completed_at: row.try_get("completed_at")?,
        completed_by,
    })
}

fn actor_from_row(row: &PgRow, role_column: &str, id_column: &str) -> Result<Actor, StoreError> {
    let role: String = row.try_get(role_column)?;
    let id: Uuid = row.try_get(id_column)?;
    Ok(Actor::new(parse_label::<Role>(&role)?, id))
}

async fn insert_audit(conn: &mut PgConnection, entry: &AuditEntry) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (id, entity_kind, entity_id, from_status, to_status,
                               actor_role, actor_id, at, reason)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(entry.id)
    .bind(entry.entity_kind.as_str())
    .bind(entry.entity_id)
    .bind(&entry.from_status)
    .bind(&entry.to_status)
    .bind(entry.actor.role().as_str())
    .bind(entry.actor.id())
    .bind(entry.at)
    .bind(&entry.reason)
    .execute(conn)
    .await?;
    Ok(())
}

async fn replace_stops(conn: &mut PgConnection, schedule: &Schedule) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM schedule_stops WHERE schedule_id = $1")
        .bind(schedule.id)
        .execute(&mut *conn)
        .await?;
    for (position, stop) in schedule.stops.iter().enumerate() {
        let position = i32::try_from(position)
            .map_err(|_| StoreError::Decode(format!("stop position {position} overflows INTEGER")))?;
        sqlx::query(
            r#"
            INSERT INTO schedule_stops (id, schedule_id, position, location_name, location_type,
                                        address, barangay, latitude, longitude, request_id,
                                        completed_at, completed_by_role, completed_by_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(stop.id)
        .bind(schedule.id)
        .bind(position)
        .bind(&stop.location_name)
        .bind(&stop.location_type)
        .bind(&stop.address)
        .bind(&stop.barangay)
        .bind(stop.coordinates.map(|p| p.lat))
        .bind(stop.coordinates.map(|p| p.lng))
        .bind(stop.request_id)
        .bind(stop.completed_at)
        .bind(stop.completed_by.map(|a| a.role().as_str()))
        .bind(stop.completed_by.map(|a| a.id()))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn conflict_or_missing(
    conn: &mut PgConnection,
    table: &'static str,
    entity: &'static str,
    id: Uuid,
    expected: u64,
) -> StoreError {
    let sql = format!("SELECT revision FROM {table} WHERE id = $1");
    match sqlx::query_scalar::<_, i64>(&sql)
        .bind(id)
        .fetch_optional(conn)
        .await
    {
        Ok(Some(actual)) => StoreError::Conflict {
            entity,
            id,
            expected,
            actual: actual.max(0) as u64,
        },
        Ok(None) => StoreError::NotFound { entity, id },
        Err(err) => StoreError::Database(err),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn next_request_sequence(&self) -> Result<u64, StoreError> {
        let value: i64 = sqlx::query_scalar("SELECT nextval('request_number_seq')")
            .fetch_one(&self.pool)
            .await?;
        revision_from_db(value)
    }

    async fn insert_request(&self, request: &Request, audit: &AuditEntry) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO requests (id, request_number, client_id, contact_name, contact_phone,
                                  contact_email, barangay, address, priority, preferred_date,
                                  preferred_time_slot, special_instructions, photo_refs, status,
                                  rejection_reason, cancellation_reason, assigned_collector,
                                  assignment_notes, completed_by, payment_id, revision,
                                  created_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23, $24)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(request.id)
        .bind(&request.request_number)
        .bind(request.client_id)
        .bind(&request.contact.name)
        .bind(&request.contact.phone)
        .bind(&request.contact.email)
        .bind(&request.barangay)
        .bind(&request.address)
        .bind(request.priority.as_str())
        .bind(request.preferred_date)
        .bind(&request.preferred_time_slot)
        .bind(&request.special_instructions)
        .bind(Json(&request.photo_refs))
        .bind(request.status.as_str())
        .bind(&request.rejection_reason)
        .bind(&request.cancellation_reason)
        .bind(request.assigned_collector)
        .bind(&request.assignment_notes)
        .bind(request.completed_by)
        .bind(request.payment_id)
        .bind(revision_to_db(request.revision)?)
        .bind(request.created_at)
        .bind(request.updated_at)
        .bind(request.completed_at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate {
                entity: "request",
                id: request.id,
            });
        }
        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<Request>, StoreError> {
        let row = sqlx::query("SELECT * FROM requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn list_requests(&self, status: Option<RequestStatus>) -> Result<Vec<Request>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM requests
             WHERE ($1::TEXT IS NULL OR status = $1)
             ORDER BY created_at, request_number
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn update_request(
        &self,
        request: &Request,
        expected_revision: u64,
        audit: &AuditEntry,
    ) -> Result<Request, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE requests
               SET status = $3,
                   rejection_reason = $4,
                   cancellation_reason = $5,
                   assigned_collector = $6,
                   assignment_notes = $7,
                   completed_by = $8,
                   payment_id = $9,
                   updated_at = $10,
                   completed_at = $11,
                   revision = revision + 1
             WHERE id = $1
               AND revision = $2
            "#,
        )
        .bind(request.id)
        .bind(revision_to_db(expected_revision)?)
        .bind(request.status.as_str())
        .bind(&request.rejection_reason)
        .bind(&request.cancellation_reason)
        .bind(request.assigned_collector)
        .bind(&request.assignment_notes)
        .bind(request.completed_by)
        .bind(request.payment_id)
        .bind(request.updated_at)
        .bind(request.completed_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(
                conflict_or_missing(&mut tx, "requests", "request", request.id, expected_revision).await,
            );
        }
        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;

        let mut stored = request.clone();
        stored.revision = expected_revision + 1;
        Ok(stored)
    }

    async fn insert_schedule(&self, schedule: &Schedule, audit: &AuditEntry) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO schedules (id, name, description, schedule_type, start_date, end_date,
                                   start_time, end_time, status, special_instructions,
                                   primary_collector, backup_collector, created_by, revision,
                                   created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.description)
        .bind(schedule.schedule_type.as_str())
        .bind(schedule.start_date)
        .bind(schedule.end_date)
        .bind(schedule.start_time)
        .bind(schedule.end_time)
        .bind(schedule.status.as_str())
        .bind(&schedule.special_instructions)
        .bind(schedule.primary_collector)
        .bind(schedule.backup_collector)
        .bind(schedule.created_by)
        .bind(revision_to_db(schedule.revision)?)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate {
                entity: "schedule",
                id: schedule.id,
            });
        }
        replace_stops(&mut tx, schedule).await?;
        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, StoreError> {
        let Some(row) = sqlx::query("SELECT * FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let mut stops = self.stops_for(&[id]).await?;
        schedule_from_row(&row, stops.remove(&id).unwrap_or_default()).map(Some)
    }

    async fn list_schedules(&self, status: Option<ScheduleStatus>) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM schedules
             WHERE ($1::TEXT IS NULL OR status = $1)
             ORDER BY created_at, id
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        let ids = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<Result<Vec<_>, _>>()?;
        let mut stops = self.stops_for(&ids).await?;
        rows.iter()
            .zip(ids)
            .map(|(row, id)| schedule_from_row(row, stops.remove(&id).unwrap_or_default()))
            .collect()
    }

    async fn update_schedule(
        &self,
        schedule: &Schedule,
        expected_revision: u64,
        audit: Option<&AuditEntry>,
    ) -> Result<Schedule, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE schedules
               SET name = $3,
                   description = $4,
                   schedule_type = $5,
                   start_date = $6,
                   end_date = $7,
                   start_time = $8,
                   end_time = $9,
                   status = $10,
                   special_instructions = $11,
                   primary_collector = $12,
                   backup_collector = $13,
                   updated_at = $14,
                   revision = revision + 1
             WHERE id = $1
               AND revision = $2
            "#,
        )
        .bind(schedule.id)
        .bind(revision_to_db(expected_revision)?)
        .bind(&schedule.name)
        .bind(&schedule.description)
        .bind(schedule.schedule_type.as_str())
        .bind(schedule.start_date)
        .bind(schedule.end_date)
        .bind(schedule.start_time)
        .bind(schedule.end_time)
        .bind(schedule.status.as_str())
        .bind(&schedule.special_instructions)
        .bind(schedule.primary_collector)
        .bind(schedule.backup_collector)
        .bind(schedule.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(
                conflict_or_missing(&mut tx, "schedules", "schedule", schedule.id, expected_revision)
                    .await,
            );
        }
        replace_stops(&mut tx, schedule).await?;
        if let Some(entry) = audit {
            insert_audit(&mut tx, entry).await?;
        }
        tx.commit().await?;

        let mut stored = schedule.clone();
        stored.revision = expected_revision + 1;
        Ok(stored)
    }

    async fn delete_schedule(&self, id: ScheduleId, expected_revision: u64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1 AND revision = $2")
            .bind(id)
            .bind(revision_to_db(expected_revision)?)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(conflict_or_missing(&mut tx, "schedules", "schedule", id, expected_revision).await);
        }
        tx.commit().await?;
        Ok(())
    }

    async fn audit_trail(&self, entity_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_kind, entity_id, from_status, to_status, actor_role, actor_id, at, reason
              FROM audit_log
             WHERE entity_id = $1
             ORDER BY seq
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let entity_kind: String = row.try_get("entity_kind")?;
            out.push(AuditEntry {
                id: row.try_get("id")?,
                entity_kind: parse_label(&entity_kind)?,
                entity_id: row.try_get("entity_id")?,
                from_status: row.try_get("from_status")?,
                to_status: row.try_get("to_status")?,
                actor: actor_from_row(&row, "actor_role", "actor_id")?,
                at: row.try_get("at")?,
                reason: row.try_get("reason")?,
            });
        }
        Ok(out)
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO payments (id, request_id, amount, reference, paid_on,
                                  recorded_by_role, recorded_by_id, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(payment.id)
        .bind(payment.request_id)
        .bind(payment.amount)
        .bind(&payment.reference)
        .bind(payment.paid_on)
        .bind(payment.recorded_by.role().as_str())
        .bind(payment.recorded_by.id())
        .bind(payment.recorded_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate {
                entity: "payment",
                id: payment.id,
            });
        }
        Ok(())
    }

    async fn payments_for_request(&self, request_id: RequestId) -> Result<Vec<PaymentRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, request_id, amount, reference, paid_on, recorded_by_role, recorded_by_id,
                   recorded_at
              FROM payments
             WHERE request_id = $1
             ORDER BY recorded_at
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(PaymentRecord {
                id: row.try_get("id")?,
                request_id: row.try_get("request_id")?,
                amount: row.try_get("amount")?,
                reference: row.try_get("reference")?,
                paid_on: row.try_get("paid_on")?,
                recorded_by: actor_from_row(&row, "recorded_by_role", "recorded_by_id")?,
                recorded_at: row.try_get("recorded_at")?,
            });
        }
        Ok(out)
    }

    async fn upsert_collector(&self, profile: &CollectorProfile) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO collectors (id, name, contact_number)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name,
                   contact_number = EXCLUDED.contact_number
            "#,
        )
        .bind(profile.id)
        .bind(&profile.name)
        .bind(&profile.contact_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_collectors(&self) -> Result<Vec<CollectorProfile>, StoreError> {
        let rows = sqlx::query("SELECT id, name, contact_number FROM collectors ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CollectorProfile {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                contact_number: row.try_get("contact_number")?,
            });
        }
        Ok(out)
    }

    async fn insert_rating(&self, rating: &CollectorRating) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO collector_ratings (id, request_id, collector_id, client_id, stars,
                                           comment, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(rating.id)
        .bind(rating.request_id)
        .bind(rating.collector_id)
        .bind(rating.client_id)
        .bind(i16::from(rating.stars))
        .bind(&rating.comment)
        .bind(rating.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Duplicate {
                entity: "rating",
                id: rating.request_id,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn rating_for_request(&self, request_id: RequestId) -> Result<Option<CollectorRating>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, request_id, collector_id, client_id, stars, comment, created_at
              FROM collector_ratings
             WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let stars: i16 = row.try_get("stars")?;
        Ok(Some(CollectorRating {
            id: row.try_get("id")?,
            request_id: row.try_get("request_id")?,
            collector_id: row.try_get("collector_id")?,
            client_id: row.try_get("client_id")?,
            stars: u8::try_from(stars)
                .map_err(|_| StoreError::Decode(format!("rating stars {stars} out of range")))?,
            comment: row.try_get("comment")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn collector_workloads(
        &self,
        window: CompletionWindow,
    ) -> Result<HashMap<CollectorId, CollectorWorkload>, StoreError> {
        let binding_states = RequestStatus::ALL
            .iter()
            .filter(|s| s.holds_collector())
            .map(|s| s.as_str().to_string())
            .collect::<Vec<_>>();

        let rows = sqlx::query(
            r#"
            SELECT c.id,
                   (SELECT COUNT(*)
                      FROM requests r
                     WHERE r.assigned_collector = c.id
                       AND r.status = ANY($1)) AS active_assignments,
                   (SELECT COUNT(*)
                      FROM requests r
                     WHERE r.completed_by = c.id
                       AND r.status = 'completed'
                       AND r.completed_at >= $2
                       AND r.completed_at < $3) AS completed_today,
                   (SELECT COUNT(*)
                      FROM collector_ratings cr
                     WHERE cr.collector_id = c.id) AS rating_count,
                   (SELECT AVG(cr.stars)::FLOAT8
                      FROM collector_ratings cr
                     WHERE cr.collector_id = c.id) AS average_rating
              FROM collectors c
            "#,
        )
        .bind(&binding_states)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let active: i64 = row.try_get("active_assignments")?;
            let completed: i64 = row.try_get("completed_today")?;
            let rated: i64 = row.try_get("rating_count")?;
            out.insert(
                id,
                CollectorWorkload {
                    active_assignments: active.clamp(0, i64::from(u32::MAX)) as u32,
                    completed_today: completed.clamp(0, i64::from(u32::MAX)) as u32,
                    rating_count: rated.clamp(0, i64::from(u32::MAX)) as u32,
                    average_rating: row.try_get("average_rating")?,
                },
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use wcm_core::{EntityKind, NewRequest, Priority};

    async fn store_from_env() -> Option<PgStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PgStore::connect(&url).await.ok()?;
        store.migrate().await.ok()?;
        Some(store)
    }

    #[tokio::test]
    async fn compare_and_swap_against_postgres() {
        let Some(store) = store_from_env().await else {
            return;
        };
        let seq = store.next_request_sequence().await.unwrap();
        let now = Utc::now();
        let request = Request::new(
            Uuid::new_v4(),
            wcm_core::format_request_number(2026, seq),
            Uuid::new_v4(),
            NewRequest {
                contact: ContactInfo {
                    name: "Lito Reyes".into(),
                    phone: "09180000000".into(),
                    email: None,
                },
                barangay: "Poblacion".into(),
                address: "3 Rizal Ave".into(),
                priority: Priority::Urgent,
                preferred_date: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
                preferred_time_slot: None,
                special_instructions: None,
                photo_refs: vec!["photos/1.jpg".into()],
            },
            now,
        );
        let actor = Actor::Client(request.client_id);
        let created = AuditEntry::new(EntityKind::Request, request.id, None, "pending", actor, now, None);
        store.insert_request(&request, &created).await.unwrap();

        let mut cancelled = request.clone();
        cancelled.status = RequestStatus::Cancelled;
        cancelled.cancellation_reason = Some("moved".into());
        let entry = AuditEntry::new(
            EntityKind::Request,
            request.id,
            Some("pending"),
            "cancelled",
            actor,
            now,
            Some("moved".into()),
        );
        assert_eq!(store.update_request(&cancelled, 0, &entry).await.unwrap().revision, 1);
        let err = store.update_request(&cancelled, 0, &entry).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { actual: 1, .. }));

        let loaded = store.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RequestStatus::Cancelled);
        assert_eq!(loaded.photo_refs, vec!["photos/1.jpg".to_string()]);
        assert_eq!(store.audit_trail(request.id).await.unwrap().len(), 2);
    }
}
