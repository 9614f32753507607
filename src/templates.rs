//! Email template storage. `subject` and `preamble` are authored
//! expression/statement sources, `html` is embedded-expression template
//! text; all three are opaque here and only interpreted by the sandbox.

use sqlx::MySql;
use sqlx::Row;
use sqlx::Transaction;

#[derive(Debug, Clone)]
pub struct Template {
    pub id: String,
    pub subject: String,
    pub html: String,
    pub preamble: String,
}

pub async fn insert(
    tx: &mut Transaction<'static, MySql>,
    template: &Template,
) -> Result<(), anyhow::Error> {
    sqlx::query("INSERT INTO templates (id, subject, html, preamble) VALUES (?, ?, ?, ?)")
        .bind(&template.id)
        .bind(&template.subject)
        .bind(&template.html)
        .bind(&template.preamble)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn update(
    tx: &mut Transaction<'static, MySql>,
    template: &Template,
) -> Result<(), anyhow::Error> {
    let updated = sqlx::query("UPDATE templates SET subject = ?, html = ?, preamble = ? WHERE id = ?")
        .bind(&template.subject)
        .bind(&template.html)
        .bind(&template.preamble)
        .bind(&template.id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    if updated == 0 {
        anyhow::bail!("Template {} not found", template.id);
    }
    Ok(())
}

pub async fn delete(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
) -> Result<bool, anyhow::Error> {
    let deleted = sqlx::query("DELETE FROM templates WHERE id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    Ok(deleted > 0)
}

pub async fn get(
    tx: &mut Transaction<'static, MySql>,
    id: &str,
) -> Result<Option<Template>, anyhow::Error> {
    let row = sqlx::query("SELECT id, subject, html, preamble FROM templates WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.map(template_from_row))
}

pub async fn list(
    tx: &mut Transaction<'static, MySql>
) -> Result<Vec<Template>, anyhow::Error> {
    let rows = sqlx::query("SELECT id, subject, html, preamble FROM templates ORDER BY id")
        .fetch_all(&mut **tx)
        .await?;
    Ok(rows.into_iter().map(template_from_row).collect())
}

fn template_from_row(row: sqlx::mysql::MySqlRow) -> Template {
    Template {
        id: row.get("id"),
        subject: row.get("subject"),
        html: row.get("html"),
        preamble: row.get("preamble"),
    }
}
