//! Query engine: filtered listing, facets, distributions, distinct values.
//!
//! Every public method ANDs the caller's filters onto the live corpus
//! (`absorbed_into IS NULL`). Sort keys are whitelisted and every ordering
//! ends in `id ASC` so pagination is stable under ties.

use chrono::NaiveDate;
use sqlx::{Postgres, QueryBuilder};
use std::collections::BTreeMap;
use std::sync::Arc;

use licita_core::error::AppError;
use licita_core::models::Licitacion;
use licita_core::query::{
    analyze_query, apply_auto_filters, FacetCount, FacetDimension, FechaCampo, ListFilter, Page,
    Pagination, SmartQuery, Sort, SortField, SortOrder,
};

use crate::cache::QueryCaches;
use crate::repository::{rows_to_domain, LicitacionRepository, LicitacionRow, LICITACION_COLUMNS};

/// Facet lists stop at this many values per dimension.
const FACET_LIMIT: i64 = 30;

/// Fields `distinct` accepts, mapped to their columns.
const DISTINCT_FIELDS: &[(&str, &str)] = &[
    ("fuente", "fuente"),
    ("jurisdiccion", "jurisdiccion"),
    ("category", "category"),
    ("organization", "organization"),
    ("tipo_procedimiento", "tipo_procedimiento"),
    ("nodo", "nodo"),
];

/// Aggregate corpus statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CorpusStats {
    pub total: i64,
    pub by_fuente: BTreeMap<String, i64>,
    pub last_update: Option<chrono::DateTime<chrono::Utc>>,
}

/// Estado distribution for the dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EstadoDistribution {
    pub by_estado: BTreeMap<String, i64>,
    pub by_year: BTreeMap<i32, i64>,
    pub vigentes_hoy: i64,
}

/// Read side of the corpus, with TTL caches over the aggregates.
pub struct QueryEngine {
    repo: LicitacionRepository,
    caches: QueryCaches,
}

impl QueryEngine {
    pub fn new(repo: LicitacionRepository) -> Self {
        Self {
            repo,
            caches: QueryCaches::new(),
        }
    }

    /// Drops the aggregate caches; ingestion calls this after writes.
    pub fn invalidate_caches(&self) {
        self.caches.invalidate();
    }

    /// One filtered, sorted, paginated page.
    pub async fn list_page(
        &self,
        filter: &ListFilter,
        sort: Sort,
        pagination: Pagination,
    ) -> Result<Page<Licitacion>, AppError> {
        let total = self.count(filter).await?;

        let mut qb = QueryBuilder::new(format!(
            "SELECT {} FROM licitaciones",
            LICITACION_COLUMNS
        ));
        push_filters(&mut qb, filter);
        push_order(&mut qb, sort);
        qb.push(" LIMIT ");
        qb.push_bind(pagination.limit());
        qb.push(" OFFSET ");
        qb.push_bind(pagination.offset());

        let rows = qb
            .build_query_as::<LicitacionRow>()
            .fetch_all(self.repo.pool())
            .await?;

        Ok(Page {
            items: rows_to_domain(rows)?,
            page: pagination.page,
            size: pagination.size,
            total,
        })
    }

    /// Smart search: mines `q` for year/fuente/rubro keywords, applies the
    /// detected filters, and echoes them back for UI display.
    pub async fn search(
        &self,
        mut filter: ListFilter,
        sort: Sort,
        pagination: Pagination,
    ) -> Result<(Page<Licitacion>, SmartQuery), AppError> {
        let smart = match filter.q.clone() {
            Some(q) => {
                let fuentes = self.distinct("fuente", &ListFilter::default()).await?;
                let rubros = self.rubros().await?;
                let smart = analyze_query(&q, &fuentes, &rubros);
                apply_auto_filters(&mut filter, &smart);
                smart
            }
            None => SmartQuery::default(),
        };
        let page = self.list_page(&filter, sort, pagination).await?;
        Ok((page, smart))
    }

    /// Active tenders: vigente or prorrogada, opening today or later,
    /// soonest opening first.
    pub async fn vigentes(
        &self,
        today: NaiveDate,
        pagination: Pagination,
    ) -> Result<Page<Licitacion>, AppError> {
        let base_where = " WHERE absorbed_into IS NULL AND estado IN ('vigente', 'prorrogada') AND opening_date >= ";

        let mut count_qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM licitaciones");
        count_qb.push(base_where);
        count_qb.push_bind(today);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(self.repo.pool())
            .await?;

        let mut qb = QueryBuilder::new(format!(
            "SELECT {} FROM licitaciones",
            LICITACION_COLUMNS
        ));
        qb.push(base_where);
        qb.push_bind(today);
        qb.push(" ORDER BY opening_date ASC, id ASC LIMIT ");
        qb.push_bind(pagination.limit());
        qb.push(" OFFSET ");
        qb.push_bind(pagination.offset());

        let rows = qb
            .build_query_as::<LicitacionRow>()
            .fetch_all(self.repo.pool())
            .await?;

        Ok(Page {
            items: rows_to_domain(rows)?,
            page: pagination.page,
            size: pagination.size,
            total,
        })
    }

    /// Facet counts per dimension. Each dimension is excluded from its own
    /// aggregation, so the counts answer "what would I get if I also
    /// picked this value".
    pub async fn facets(
        &self,
        filter: &ListFilter,
    ) -> Result<Arc<BTreeMap<String, Vec<FacetCount>>>, AppError> {
        let key = serde_json::to_string(filter)?;
        if let Some(cached) = self.caches.facets.get(&key) {
            return Ok(cached);
        }

        let mut result = BTreeMap::new();
        for dimension in FacetDimension::ALL {
            let sub_filter = filter.without_dimension(dimension);
            let mut qb = QueryBuilder::new(format!(
                "SELECT {} AS value, COUNT(*) AS count FROM licitaciones",
                dimension.column()
            ));
            push_filters(&mut qb, &sub_filter);
            qb.push(format!(" AND {} IS NOT NULL", dimension.column()));
            qb.push(" GROUP BY 1 ORDER BY 2 DESC, 1 ASC LIMIT ");
            qb.push_bind(FACET_LIMIT);

            let counts: Vec<(String, i64)> = qb
                .build_query_as()
                .fetch_all(self.repo.pool())
                .await?;
            result.insert(
                dimension.key().to_string(),
                counts
                    .into_iter()
                    .map(|(value, count)| FacetCount { value, count })
                    .collect(),
            );
        }

        let result = Arc::new(result);
        self.caches.facets.insert(key, Arc::clone(&result));
        Ok(result)
    }

    /// Ordered distinct values of a whitelisted field.
    pub async fn distinct(
        &self,
        field: &str,
        filter: &ListFilter,
    ) -> Result<Vec<String>, AppError> {
        let column = DISTINCT_FIELDS
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, column)| *column)
            .ok_or_else(|| AppError::Generic(format!("unknown distinct field '{}'", field)))?;

        let key = format!("{}|{}", field, serde_json::to_string(filter)?);
        if let Some(cached) = self.caches.distinct.get(&key) {
            return Ok(cached.as_ref().clone());
        }

        let mut qb = QueryBuilder::new(format!("SELECT DISTINCT {} FROM licitaciones", column));
        push_filters(&mut qb, filter);
        qb.push(format!(" AND {} IS NOT NULL ORDER BY 1 ASC", column));

        let values: Vec<String> = qb
            .build_query_scalar()
            .fetch_all(self.repo.pool())
            .await?;
        self.caches
            .distinct
            .insert(key, Arc::new(values.clone()));
        Ok(values)
    }

    /// The rubro list, cached on its own longer TTL.
    pub async fn rubros(&self) -> Result<Vec<String>, AppError> {
        if let Some(cached) = self.caches.rubros.get("rubros") {
            return Ok(cached.as_ref().clone());
        }
        let values: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT category FROM licitaciones \
             WHERE absorbed_into IS NULL AND category IS NOT NULL ORDER BY 1 ASC",
        )
        .fetch_all(self.repo.pool())
        .await?;
        self.caches
            .rubros
            .insert("rubros".to_string(), Arc::new(values.clone()));
        Ok(values)
    }

    /// Corpus-wide estado / year distribution.
    pub async fn estado_distribution(
        &self,
        today: NaiveDate,
    ) -> Result<EstadoDistribution, AppError> {
        let by_estado: Vec<(String, i64)> = sqlx::query_as(
            "SELECT estado, COUNT(*) FROM licitaciones \
             WHERE absorbed_into IS NULL GROUP BY 1",
        )
        .fetch_all(self.repo.pool())
        .await?;

        let by_year: Vec<(i32, i64)> = sqlx::query_as(
            "SELECT EXTRACT(YEAR FROM publication_date)::INT4, COUNT(*) FROM licitaciones \
             WHERE absorbed_into IS NULL AND publication_date IS NOT NULL GROUP BY 1",
        )
        .fetch_all(self.repo.pool())
        .await?;

        let vigentes_hoy: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM licitaciones \
             WHERE absorbed_into IS NULL \
               AND estado IN ('vigente', 'prorrogada') AND opening_date >= $1",
        )
        .bind(today)
        .fetch_one(self.repo.pool())
        .await?;

        Ok(EstadoDistribution {
            by_estado: by_estado.into_iter().collect(),
            by_year: by_year.into_iter().collect(),
            vigentes_hoy,
        })
    }

    /// Totals for the health endpoint and the CLI stats view.
    pub async fn stats(&self) -> Result<CorpusStats, AppError> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM licitaciones WHERE absorbed_into IS NULL")
                .fetch_one(self.repo.pool())
                .await?;
        let by_fuente: Vec<(String, i64)> = sqlx::query_as(
            "SELECT fuente, COUNT(*) FROM licitaciones \
             WHERE absorbed_into IS NULL GROUP BY 1 ORDER BY 2 DESC",
        )
        .fetch_all(self.repo.pool())
        .await?;
        let last_update: Option<chrono::DateTime<chrono::Utc>> =
            sqlx::query_scalar("SELECT MAX(updated_at) FROM licitaciones")
                .fetch_one(self.repo.pool())
                .await?;

        Ok(CorpusStats {
            total,
            by_fuente: by_fuente.into_iter().collect(),
            last_update,
        })
    }

    async fn count(&self, filter: &ListFilter) -> Result<i64, AppError> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM licitaciones");
        push_filters(&mut qb, filter);
        Ok(qb.build_query_scalar().fetch_one(self.repo.pool()).await?)
    }
}

/// Escapes LIKE wildcards in user text.
fn like_pattern(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    format!("%{}%", escaped)
}

fn date_column(campo: FechaCampo) -> &'static str {
    match campo {
        FechaCampo::PublicationDate => "publication_date",
        FechaCampo::OpeningDate => "opening_date",
        FechaCampo::FechaScraping => "created_at",
    }
}

/// Appends the WHERE clause for a [`ListFilter`]. Shared by the listing,
/// count, facet, and distinct queries so their semantics cannot diverge.
fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &ListFilter) {
    qb.push(" WHERE absorbed_into IS NULL");

    if let Some(q) = filter.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        // The tsvector expression matches the GIN index; the ILIKE arm
        // covers terms Spanish stemming drops (sigla/expediente fragments).
        qb.push(
            " AND (to_tsvector('spanish', coalesce(title, '') || ' ' || coalesce(description, '') \
             || ' ' || coalesce(organization, '') || ' ' || coalesce(category, '')) @@ plainto_tsquery('spanish', ",
        );
        qb.push_bind(q.to_string());
        qb.push(") OR title ILIKE ");
        qb.push_bind(like_pattern(q));
        qb.push(")");
    }
    if let Some(fuente) = &filter.fuente {
        qb.push(" AND fuente = ");
        qb.push_bind(fuente.clone());
    }
    if !filter.fuente_exclude.is_empty() {
        qb.push(" AND fuente <> ALL(");
        qb.push_bind(filter.fuente_exclude.clone());
        qb.push(")");
    }
    if let Some(estado) = filter.estado {
        qb.push(" AND estado = ");
        qb.push_bind(estado.as_str());
    }
    if let Some(category) = &filter.category {
        qb.push(" AND category = ");
        qb.push_bind(category.clone());
    }
    if let Some(workflow_state) = filter.workflow_state {
        qb.push(" AND workflow_state = ");
        qb.push_bind(workflow_state.as_str());
    }
    if let Some(jurisdiccion) = &filter.jurisdiccion {
        qb.push(" AND jurisdiccion = ");
        qb.push_bind(jurisdiccion.clone());
    }
    if filter.only_national {
        qb.push(" AND jurisdiccion ILIKE 'nacional'");
    }
    if let Some(tipo) = &filter.tipo_procedimiento {
        qb.push(" AND tipo_procedimiento = ");
        qb.push_bind(tipo.clone());
    }
    if let Some(organization) = &filter.organization {
        qb.push(" AND organization = ");
        qb.push_bind(organization.clone());
    }
    if let Some(nodo) = &filter.nodo {
        qb.push(" AND nodo = ");
        qb.push_bind(nodo.clone());
    }
    if let Some(budget_min) = filter.budget_min {
        qb.push(" AND budget >= ");
        qb.push_bind(budget_min);
    }
    if let Some(budget_max) = filter.budget_max {
        qb.push(" AND budget <= ");
        qb.push_bind(budget_max);
    }
    let column = date_column(filter.fecha_campo);
    if let Some(desde) = filter.fecha_desde {
        qb.push(format!(" AND {} >= ", column));
        qb.push_bind(desde);
    }
    if let Some(hasta) = filter.fecha_hasta {
        qb.push(format!(" AND {} <= ", column));
        qb.push_bind(hasta);
    }
    if let Some(year) = filter.year {
        let start = NaiveDate::from_ymd_opt(year, 1, 1);
        let end = NaiveDate::from_ymd_opt(year + 1, 1, 1);
        if let (Some(start), Some(end)) = (start, end) {
            qb.push(" AND publication_date >= ");
            qb.push_bind(start);
            qb.push(" AND publication_date < ");
            qb.push_bind(end);
        }
    }
    if let Some(nuevas_desde) = filter.nuevas_desde {
        qb.push(" AND first_seen_at >= ");
        qb.push_bind(nuevas_desde);
    }
}

fn push_order(qb: &mut QueryBuilder<'_, Postgres>, sort: Sort) {
    let column = match sort.field {
        SortField::PublicationDate => "publication_date",
        SortField::OpeningDate => "opening_date",
        SortField::FechaScraping => "created_at",
        SortField::Budget => "budget",
    };
    let direction = match sort.order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    // Ties always break by id so pagination stays stable.
    qb.push(format!(
        " ORDER BY {} {} NULLS LAST, id ASC",
        column, direction
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use licita_core::models::Estado;

    fn render(filter: &ListFilter) -> String {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM licitaciones");
        push_filters(&mut qb, filter);
        qb.into_sql()
    }

    #[test]
    fn test_empty_filter_only_excludes_absorbed() {
        let sql = render(&ListFilter::default());
        assert_eq!(
            sql,
            "SELECT COUNT(*) FROM licitaciones WHERE absorbed_into IS NULL"
        );
    }

    #[test]
    fn test_filters_and_together() {
        let filter = ListFilter {
            fuente: Some("boletin".into()),
            estado: Some(Estado::Vigente),
            year: Some(2025),
            ..Default::default()
        };
        let sql = render(&filter);
        assert!(sql.contains("fuente = "));
        assert!(sql.contains("estado = "));
        assert!(sql.contains("publication_date >= "));
        assert!(sql.contains("publication_date < "));
    }

    #[test]
    fn test_text_filter_uses_index_and_fallback() {
        let filter = ListFilter {
            q: Some("ruta 40".into()),
            ..Default::default()
        };
        let sql = render(&filter);
        assert!(sql.contains("plainto_tsquery('spanish'"));
        assert!(sql.contains("title ILIKE "));
    }

    #[test]
    fn test_fecha_campo_picks_column() {
        let filter = ListFilter {
            fecha_desde: NaiveDate::from_ymd_opt(2025, 1, 1),
            fecha_campo: FechaCampo::OpeningDate,
            ..Default::default()
        };
        let sql = render(&filter);
        assert!(sql.contains("opening_date >= "));

        let filter = ListFilter {
            fecha_desde: NaiveDate::from_ymd_opt(2025, 1, 1),
            fecha_campo: FechaCampo::FechaScraping,
            ..Default::default()
        };
        assert!(render(&filter).contains("created_at >= "));
    }

    #[test]
    fn test_order_by_always_tie_breaks_on_id() {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT 1");
        push_order(
            &mut qb,
            Sort {
                field: SortField::Budget,
                order: SortOrder::Asc,
            },
        );
        assert_eq!(qb.into_sql(), "SELECT 1 ORDER BY budget ASC NULLS LAST, id ASC");
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("100%"), "%100\\%%");
        assert_eq!(like_pattern("a_b"), "%a\\_b%");
        assert_eq!(like_pattern("ruta"), "%ruta%");
    }
}
