/// Product catalogue export run as a bulk operation. Variants and images come back
/// as child lines tagged with `__parentId`.
pub const PRODUCT_EXPORT_QUERY: &str = r#"{
  products {
    edges {
      node {
        id
        title
        description
        productType
        vendor
        status
        tags
        options {
          name
          values
        }
        variants {
          edges {
            node {
              id
              sku
              title
              price
              compareAtPrice
              inventoryQuantity
              inventoryItem {
                measurement {
                  weight {
                    unit
                    value
                  }
                }
              }
              selectedOptions {
                name
                value
              }
            }
          }
        }
        images {
          edges {
            node {
              id
              src
              altText
            }
          }
        }
      }
    }
  }
}"#;

pub const RUN_QUERY_MUTATION: &str = r#"mutation bulkImportRun($query: String!) {
  bulkOperationRunQuery(query: $query) {
    bulkOperation {
      id
      status
    }
    userErrors {
      field
      message
    }
  }
}"#;

pub const OPERATION_STATUS_QUERY: &str = r#"query bulkImportStatus($id: ID!) {
  node(id: $id) {
    ... on BulkOperation {
      id
      status
      errorCode
      url
      partialDataUrl
      objectCount
    }
  }
}"#;

pub const CANCEL_MUTATION: &str = r#"mutation bulkImportCancel($id: ID!) {
  bulkOperationCancel(id: $id) {
    bulkOperation {
      id
      status
    }
    userErrors {
      field
      message
    }
  }
}"#;
