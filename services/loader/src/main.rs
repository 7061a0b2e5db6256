//! Loader Service - Ingests CSV measurement exports into plant reports
//!
//! Responsibilities:
//! - Read a CSV export produced by field measurement spreadsheets
//! - Recover logical rows across quoted line breaks
//! - Map header cells to registered plant systems and their parameters
//! - Normalize localized dates and thousand-separated numbers
//! - Submit one report per data row to the reports API
//!
//! CRITICAL: parsing is BEST-EFFORT
//! Field exports are inconsistent, so a malformed cell never aborts the
//! run: bad numbers become 0, bad dates become today, over-long rows are
//! realigned or truncated. Real failures only surface when submitting.
//!
//! Usage:
//!   cargo run --bin loader -- --file export.csv --context contexto.json
//!   cargo run --bin loader -- --file export.csv --context contexto.json --dry-run

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads CSV measurement exports into plant reports")]
struct Args {
    /// CSV export file to ingest
    #[arg(long)]
    file: String,

    /// Load context JSON (usuario, planta, sistemas registrados)
    #[arg(long)]
    context: String,

    /// Dry run - parse and preview without submitting
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct Config {
    reports_url: String,
    reports_token: String,
    rate_limit_ms: u64,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            reports_url: std::env::var("REPORTS_URL").context("REPORTS_URL env var missing")?,
            reports_token: std::env::var("REPORTS_TOKEN").unwrap_or_default(),
            rate_limit_ms: std::env::var("RATE_LIMIT_MS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0),
        })
    }
}

// =============================================================================
// Load Context - caller-supplied identity and system registry
// =============================================================================
//
// The registry of systems is owned by the backend; the loader only consumes
// a plant-scoped snapshot of it to recognize header cells. Example:
//
//   {
//     "usuario": "Ana Torres",
//     "usuarioId": "u-102",
//     "planta": "Planta Norte",
//     "plantaId": "p-7",
//     "nombreReporte": "Reporte Semanal",
//     "sistemas": [
//       { "id": "s-1", "nombre": "Torre de Enfriamiento" },
//       { "id": "s-2", "nombre": "Osmosis" }
//     ]
//   }

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadContext {
    usuario: String,
    usuario_id: String,
    planta: String,
    planta_id: String,
    nombre_reporte: String,
    #[serde(default)]
    sistemas: Vec<Sistema>,
}

#[derive(Debug, Clone, Deserialize)]
struct Sistema {
    id: String,
    nombre: String,
}

async fn load_context(path: &str) -> Result<LoadContext> {
    let content = fs::read_to_string(path)
        .await
        .context("Failed to read load context")?;
    let ctx: LoadContext =
        serde_json::from_str(&content).context("Failed to parse load context")?;
    Ok(ctx)
}

// =============================================================================
// Report Record - one persisted snapshot per CSV data row
// =============================================================================

/// A single measured value under a (sistema, parametro) pair.
/// `es_calculado` is reserved for values derived downstream; freshly
/// parsed rows always carry `false` and `valor_original == valor`.
#[derive(Debug, Clone, Serialize)]
struct Medicion {
    valor: f64,
    unidad: String,
    #[serde(rename = "esCalculado")]
    es_calculado: bool,
    #[serde(rename = "valorOriginal")]
    valor_original: f64,
}

#[derive(Debug, Clone, Serialize)]
struct ReportRecord {
    usuario: String,
    fecha: String,
    planta: String,
    #[serde(rename = "nombreReporte")]
    nombre_reporte: String,
    parameters: BTreeMap<String, BTreeMap<String, Medicion>>,
    comentarios: String,
    #[serde(rename = "generadoEl")]
    generado_el: String,
    #[serde(rename = "plantaId")]
    planta_id: String,
    #[serde(rename = "usuarioId")]
    usuario_id: String,
}

/// Final submission tally. `last_error` keeps the most recent failure
/// message so the operator sees at least one concrete reason.
#[derive(Debug)]
struct SaveOutcome {
    ok: usize,
    fail: usize,
    last_error: Option<String>,
}

// =============================================================================
// CSV Row Recovery
// =============================================================================

/// Join raw text lines into logical rows. A row only closes once the
/// accumulated quote count is even, so quoted fields may span lines.
/// A trailing unterminated quote still emits the partial row; blank
/// rows (trailing newlines in exports) are dropped.
fn split_logical_rows(content: &str) -> Vec<String> {
    let mut rows = Vec::new();
    let mut acc = String::new();

    for line in content.lines() {
        if !acc.is_empty() {
            acc.push('\n');
        }
        acc.push_str(line);

        if acc.matches('"').count() % 2 == 0 {
            if acc.trim().is_empty() {
                acc.clear();
            } else {
                rows.push(std::mem::take(&mut acc));
            }
        }
    }

    if !acc.trim().is_empty() {
        rows.push(acc);
    }

    rows
}

/// Split one logical row into trimmed fields. A field starting with `"`
/// consumes literally until the closing quote, translating `""` into `"`
/// and embedded line breaks into a single space. Malformed quoting is
/// tolerated: whatever was accumulated is returned as-is.
fn parse_row_fields(row: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = row.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        cur.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                '\n' => cur.push(' '),
                '\r' => {}
                _ => cur.push(c),
            }
        } else {
            match c {
                '"' if cur.trim().is_empty() => {
                    in_quotes = true;
                    cur.clear();
                }
                ',' => {
                    fields.push(cur.trim().to_string());
                    cur.clear();
                }
                _ => cur.push(c),
            }
        }
    }
    fields.push(cur.trim().to_string());

    fields
}

// =============================================================================
// Header Classification
// =============================================================================

#[derive(Debug, Clone)]
struct HeaderColumn {
    sistema: String,
    parametro: String,
    col: usize,
}

/// Built once per file from the header row; immutable afterwards.
#[derive(Debug)]
struct HeaderMap {
    columns: Vec<HeaderColumn>,
    fecha_col: Option<usize>,
    comentarios_col: Option<usize>,
    width: usize,
}

/// Case/space-insensitive key for matching header cells to system names.
fn normalize_key(s: &str) -> String {
    s.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect()
}

/// Strip the decorations spreadsheets add to parameter headers: a
/// parenthesized suffix ("Cloro (ppm)") and the ".<n>" disambiguator
/// appended to repeated column names ("pH.1").
fn clean_parametro(cell: &str) -> String {
    let base = match cell.find('(') {
        Some(pos) => &cell[..pos],
        None => cell,
    };
    let base = base.trim();

    if let Some(pos) = base.rfind('.') {
        let suffix = &base[pos + 1..];
        if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
            return base[..pos].trim().to_string();
        }
    }

    base.to_string()
}

/// Scan the header row left to right, keeping a "current system" pointer.
/// A cell matching a registered system updates the pointer without
/// producing a column; any other non-empty cell under an active pointer
/// becomes a (sistema, parametro, col) mapping. Cells with no active
/// pointer and cells matching no system are discarded, never invented.
fn classify_header(cells: &[String], sistemas: &[Sistema]) -> HeaderMap {
    let known: HashMap<String, String> = sistemas
        .iter()
        .map(|s| (normalize_key(&s.nombre), s.nombre.clone()))
        .collect();

    let mut map = HeaderMap {
        columns: Vec::new(),
        fecha_col: None,
        comentarios_col: None,
        width: cells.len(),
    };
    let mut current: Option<String> = None;

    for (idx, cell) in cells.iter().enumerate() {
        let cell = cell.trim();
        if cell.is_empty() {
            continue;
        }

        let lower = cell.to_lowercase();
        if lower.starts_with("fecha") || lower.starts_with("date") {
            if map.fecha_col.is_none() {
                map.fecha_col = Some(idx);
            }
            continue;
        }
        if lower == "comentarios" || lower == "observaciones" {
            if map.comentarios_col.is_none() {
                map.comentarios_col = Some(idx);
            }
            continue;
        }

        if let Some(nombre) = known.get(&normalize_key(cell)) {
            // Canonical registry spelling, not the cell's raw text
            current = Some(nombre.clone());
            continue;
        }

        if let Some(ref sistema) = current {
            map.columns.push(HeaderColumn {
                sistema: sistema.clone(),
                parametro: clean_parametro(cell),
                col: idx,
            });
        }
    }

    map
}

// =============================================================================
// Row Alignment
// =============================================================================
//
// Exports sometimes split a thousand-separated value on its comma, so
// "1,060.80" arrives as two fields and the row ends up longer than the
// header. The repair merges a short integer with a following plain
// number when the concatenation still parses; rows that cannot be
// repaired are truncated to the header width.

fn is_short_int(s: &str) -> bool {
    !s.is_empty() && s.len() <= 4 && s.chars().all(|c| c.is_ascii_digit())
}

fn is_plain_number(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_digit() || c == '.')
        && s.chars().filter(|c| *c == '.').count() <= 1
        && s.chars().any(|c| c.is_ascii_digit())
}

fn align_row(mut fields: Vec<String>, target: usize) -> Vec<String> {
    while fields.len() > target {
        let mut merged = false;
        for i in 0..fields.len() - 1 {
            if is_short_int(&fields[i]) && is_plain_number(&fields[i + 1]) {
                let joined = format!("{}{}", fields[i], fields[i + 1]);
                if joined.parse::<f64>().is_ok() {
                    fields[i] = joined;
                    fields.remove(i + 1);
                    merged = true;
                    break;
                }
            }
        }
        if !merged {
            fields.truncate(target);
        }
    }
    fields
}

// =============================================================================
// Value / Date Normalizers
// =============================================================================

const MESES: &[(&str, u32)] = &[
    ("ene", 1),
    ("feb", 2),
    ("mar", 3),
    ("abr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("ago", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dic", 12),
];

/// Parse "D-MMM-YY" / "D-MMM-YYYY" tokens (also "." or "/" separated)
/// using the Spanish month abbreviations. Matching is by prefix so full
/// month names ("agosto") parse too. Two-digit years below 50 map to
/// 20xx, the rest to 19xx. Returns None for anything unrecognized.
fn parse_fecha_spanish(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw
        .trim()
        .split(|c| c == '-' || c == '.' || c == '/')
        .collect();
    if parts.len() != 3 {
        return None;
    }

    let dia: u32 = parts[0].trim().parse().ok()?;
    let mes_token = parts[1].trim().to_lowercase();
    let mes = MESES
        .iter()
        .find(|(abbr, _)| mes_token.starts_with(abbr))
        .map(|(_, m)| *m)?;

    let anio_token = parts[2].trim();
    let anio: i32 = anio_token.parse().ok()?;
    let anio = if anio_token.len() <= 2 {
        if anio < 50 {
            2000 + anio
        } else {
            1900 + anio
        }
    } else {
        anio
    };

    let fecha = NaiveDate::from_ymd_opt(anio, mes, dia)?;
    Some(fecha.format("%Y-%m-%d").to_string())
}

/// Lossy fallback: unrecognized dates become today so the row still
/// produces a record the operator can review before saving.
fn normalizar_fecha(raw: &str) -> String {
    parse_fecha_spanish(raw)
        .unwrap_or_else(|| Local::now().date_naive().format("%Y-%m-%d").to_string())
}

/// Forgiving numeric cleanup for spreadsheet cells: drops whitespace and
/// zero-width/BOM characters, thousands-separator commas, and any
/// leading/trailing decoration ("$", units) before parsing. Unparsable
/// input yields 0 rather than an error.
fn clean_numero(raw: &str) -> f64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| {
            !c.is_whitespace() && !matches!(c, '\u{feff}' | '\u{200b}' | '\u{200c}' | '\u{200d}')
        })
        .collect();
    let cleaned = cleaned.replace(',', "");

    let start = match cleaned.find(|c: char| c.is_ascii_digit() || c == '-' || c == '+' || c == '.')
    {
        Some(pos) => pos,
        None => return 0.0,
    };
    let end = match cleaned.rfind(|c: char| c.is_ascii_digit() || c == '.') {
        Some(pos) => pos + 1,
        None => return 0.0,
    };
    if end <= start {
        return 0.0;
    }

    cleaned[start..end].parse::<f64>().unwrap_or(0.0)
}

/// Fixed unit lookup by parameter name. Anything unknown reports ppm.
fn infer_unidad(parametro: &str) -> &'static str {
    let p = parametro.to_lowercase();
    if p.contains("ntu") || p.contains("turbidez") {
        "NTU"
    } else if p.contains("ph") {
        ""
    } else if p.contains("conduct") {
        "µs/cm"
    } else if p.contains("resist") {
        "MΩ∙cm"
    } else {
        "ppm"
    }
}

// =============================================================================
// Report Assembly
// =============================================================================

/// Parse a full CSV export into report records, one per data row.
/// Only two conditions abort: an empty/headerless file and nothing else;
/// per-cell anomalies degrade to defaults so the export always yields a
/// reviewable list.
fn build_reports(content: &str, ctx: &LoadContext) -> Result<Vec<ReportRecord>> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let rows = split_logical_rows(content);
    if rows.len() < 2 {
        anyhow::bail!("CSV must contain a header row and at least one data row");
    }
    println!("Logical rows: {} (1 header + {} data)", rows.len(), rows.len() - 1);

    let header_cells = parse_row_fields(&rows[0]);
    let header = classify_header(&header_cells, &ctx.sistemas);

    println!("Column mapping ({} mediciones):", header.columns.len());
    for column in &header.columns {
        println!("  [{:2}] {} / {}", column.col, column.sistema, column.parametro);
    }
    match header.fecha_col {
        Some(col) => println!("  Fecha: col {}", col),
        None => println!("  Fecha: no column detected, today's date will be used"),
    }
    if let Some(col) = header.comentarios_col {
        println!("  Comentarios: col {}", col);
    }
    if header.columns.is_empty() {
        println!("Warning: no header cell matched a registered system");
    }

    let mut registros = Vec::new();

    for row in &rows[1..] {
        let mut fields = parse_row_fields(row);
        if fields.len() > header.width {
            fields = align_row(fields, header.width);
        }

        let fecha = normalizar_fecha(
            header
                .fecha_col
                .and_then(|col| fields.get(col))
                .map(|s| s.as_str())
                .unwrap_or(""),
        );
        let comentarios = header
            .comentarios_col
            .and_then(|col| fields.get(col))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let mut parameters: BTreeMap<String, BTreeMap<String, Medicion>> = BTreeMap::new();
        for column in &header.columns {
            let raw = fields.get(column.col).map(|s| s.as_str()).unwrap_or("");
            let valor = clean_numero(raw);
            parameters.entry(column.sistema.clone()).or_default().insert(
                column.parametro.clone(),
                Medicion {
                    valor,
                    unidad: infer_unidad(&column.parametro).to_string(),
                    es_calculado: false,
                    valor_original: valor,
                },
            );
        }

        registros.push(ReportRecord {
            usuario: ctx.usuario.clone(),
            fecha,
            planta: ctx.planta.clone(),
            nombre_reporte: ctx.nombre_reporte.clone(),
            parameters,
            comentarios,
            generado_el: Utc::now().to_rfc3339(),
            planta_id: ctx.planta_id.clone(),
            usuario_id: ctx.usuario_id.clone(),
        });
    }

    Ok(registros)
}

// =============================================================================
// Report Persistence
// =============================================================================

/// Submit records one at a time, awaiting each response before issuing
/// the next. Failures are tallied, never retried here; the in-memory
/// list only clears when every record was accepted, so a later save
/// re-attempts exactly the pending ones.
async fn save_reports(
    client: &reqwest::Client,
    config: &Config,
    registros: &mut Vec<ReportRecord>,
) -> SaveOutcome {
    let mut outcome = SaveOutcome {
        ok: 0,
        fail: 0,
        last_error: None,
    };

    for (i, registro) in registros.iter().enumerate() {
        if config.rate_limit_ms > 0 {
            sleep(Duration::from_millis(config.rate_limit_ms)).await;
        }

        let mut request = client.post(&config.reports_url).json(registro);
        if !config.reports_token.is_empty() {
            request = request.bearer_auth(&config.reports_token);
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                outcome.ok += 1;
                println!("  ✓ [{}] {} guardado", i + 1, registro.fecha);
            }
            Ok(resp) => {
                let status = resp.status();
                let msg = resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|body| {
                        body.get("msg")
                            .or_else(|| body.get("message"))
                            .and_then(|m| m.as_str())
                            .map(|m| m.to_string())
                    })
                    .unwrap_or_else(|| format!("HTTP {}", status));
                eprintln!("  ✗ [{}] {} - {}", i + 1, registro.fecha, msg);
                outcome.fail += 1;
                outcome.last_error = Some(msg);
            }
            Err(e) => {
                eprintln!("  ✗ [{}] {} - {}", i + 1, registro.fecha, e);
                outcome.fail += 1;
                outcome.last_error = Some(e.to_string());
            }
        }
    }

    if outcome.fail == 0 {
        registros.clear();
    }

    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== Omega Report Loader ===");
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let ctx = load_context(&args.context).await?;
    println!("Planta: {} ({})", ctx.planta, ctx.planta_id);
    println!("Usuario: {} ({})", ctx.usuario, ctx.usuario_id);
    println!("Reporte: {}", ctx.nombre_reporte);
    println!("Sistemas registrados ({}):", ctx.sistemas.len());
    for sistema in &ctx.sistemas {
        println!("  {} - {}", sistema.id, sistema.nombre);
    }

    let bytes = fs::read(&args.file).await.context("Failed to read CSV file")?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    println!("\nArchivo: {} ({} bytes)", args.file, bytes.len());
    println!("Hash: sha256:{:x}", hasher.finalize());

    let content = String::from_utf8_lossy(&bytes);
    let mut registros = build_reports(&content, &ctx)?;

    println!("\nAssembled {} report(s)", registros.len());
    for (i, registro) in registros.iter().take(3).enumerate() {
        let mediciones: usize = registro.parameters.values().map(|m| m.len()).sum();
        println!(
            "  [{}] {} | {} sistemas | {} mediciones | {}",
            i + 1,
            registro.fecha,
            registro.parameters.len(),
            mediciones,
            if registro.comentarios.is_empty() {
                "-"
            } else {
                registro.comentarios.as_str()
            }
        );
    }
    if registros.len() > 3 {
        println!("  ... and {} more", registros.len() - 3);
    }

    if args.dry_run {
        println!("\nDry run - no reports submitted");
        return Ok(());
    }

    let config = Config::from_env()?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .user_agent("OmegaReportLoader/1.0")
        .build()?;

    println!("\nSubmitting {} report(s) to {}", registros.len(), config.reports_url);
    let outcome = save_reports(&client, &config, &mut registros).await;

    println!("\n=== Save Summary ===");
    println!("Guardados: {}", outcome.ok);
    println!("Fallidos: {}", outcome.fail);
    if let Some(error) = &outcome.last_error {
        println!("Último error: {}", error);
    }
    if registros.is_empty() {
        println!("All reports saved; nothing pending.");
    } else {
        println!("{} report(s) were not saved; re-run to retry.", registros.len());
    }

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
