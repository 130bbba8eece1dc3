// Diesel declarations for the system tables. User-data tables are created at
// import time and have no static schema; they are driven through sql_query.

diesel::table! {
    import_history (import_id) {
        import_id -> Uuid,
        fingerprint -> Text,
        table_name -> Text,
        status -> Text,
        strategy -> Nullable<Text>,
        mapping -> Nullable<Jsonb>,
        rows_processed -> Int4,
        rows_inserted -> Int4,
        rows_skipped -> Int4,
        rows_errored -> Int4,
        error_message -> Nullable<Text>,
        created_at -> Timestamptz,
        finished_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    mapping_errors (id) {
        id -> Uuid,
        import_id -> Uuid,
        source_row_number -> Int4,
        reason -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    import_jobs (task_id) {
        task_id -> Uuid,
        status -> Text,
        progress -> Int4,
        message -> Nullable<Text>,
        result -> Nullable<Jsonb>,
        import_id -> Nullable<Uuid>,
        payload -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    uploaded_files (id) {
        id -> Uuid,
        file_name -> Text,
        size_bytes -> Int8,
        fingerprint -> Text,
        upload_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    upload_sessions (upload_id) {
        upload_id -> Uuid,
        file_name -> Text,
        declared_size -> Int8,
        expected_parts -> Int4,
        parts -> Jsonb,
        status -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    query_threads (thread_id) {
        thread_id -> Uuid,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    query_messages (id) {
        id -> Uuid,
        thread_id -> Uuid,
        role -> Text,
        content -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(mapping_errors -> import_history (import_id));
diesel::joinable!(query_messages -> query_threads (thread_id));

diesel::allow_tables_to_appear_in_same_query!(
    import_history,
    mapping_errors,
    import_jobs,
    uploaded_files,
    upload_sessions,
    query_threads,
    query_messages,
);
