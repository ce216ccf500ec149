use crate::config::RecommendationConfig;
use crate::error::{RecError, Result};
use crate::models::*;

pub fn validate_pagination(pagination: &Pagination, config: &RecommendationConfig) -> Result<()> {
    if pagination.page == 0 {
        return Err(RecError::invalid("Page numbers start at 1"));
    }

    if pagination.page > config.max_page {
        return Err(RecError::invalid(format!("Page number too large (max {})", config.max_page)));
    }

    if pagination.page_size == 0 {
        return Err(RecError::invalid("Page size must be greater than 0"));
    }

    if pagination.page_size > config.max_page_size {
        return Err(RecError::invalid(format!(
            "Page size too large (max {})",
            config.max_page_size
        )));
    }

    Ok(())
}

pub fn validate_filters(filters: &Filters) -> Result<()> {
    for (name, bound) in [("price_from", filters.price_from), ("price_to", filters.price_to)] {
        if let Some(value) = bound {
            if !value.is_finite() || value < 0.0 {
                return Err(RecError::invalid(format!("{} must be a non-negative number", name)));
            }
        }
    }

    if let (Some(from), Some(to)) = (filters.price_from, filters.price_to) {
        if from > to {
            return Err(RecError::invalid("price_from cannot exceed price_to"));
        }
    }

    for (kind, value) in &filters.facets {
        if value.is_empty() {
            return Err(RecError::invalid(format!("Filter value for {} cannot be empty", kind)));
        }
        if value.len() > 100 {
            return Err(RecError::invalid(format!(
                "Filter value for {} too long (max 100 characters)",
                kind
            )));
        }
    }

    Ok(())
}

pub fn validate_popular_request(request: &PopularItemsRequest, config: &RecommendationConfig) -> Result<()> {
    if let Some(user_id) = request.user_id {
        if user_id.is_nil() {
            return Err(RecError::invalid("User ID cannot be nil"));
        }
    }

    validate_pagination(&request.pagination, config)?;
    validate_filters(&request.filters)
}

pub fn validate_personalized_request(
    request: &PersonalizedRequest,
    config: &RecommendationConfig,
) -> Result<()> {
    if request.user_id.is_nil() {
        return Err(RecError::invalid("User ID cannot be nil"));
    }

    validate_pagination(&request.pagination, config)?;
    validate_filters(&request.filters)
}
